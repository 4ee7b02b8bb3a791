use std::{collections::BTreeMap, path::Path, time::Duration};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{net::TcpStream, process::Command};

use super::{Tool, ToolError, ToolResult};
use crate::{dual_debug, dual_info, dual_warn};

/// Hosts the assistant depends on, with the ports each service uses.
const CRITICAL_ENDPOINTS: &[(&str, &[u16], &str)] = &[
    ("duckduckgo.com", &[443, 80], "Search API"),
    ("google.com", &[443, 80], "General connectivity"),
    ("smtp.gmail.com", &[465, 587], "Email (Gmail)"),
    ("wttr.in", &[443, 80], "Weather API"),
    ("generativelanguage.googleapis.com", &[443], "Gemini API"),
];

const VPN_PATTERNS: &[&str] = &[
    "radmin",
    "hamachi",
    "zerotier",
    "tailscale",
    "wireguard",
    "openvpn",
    "nordvpn",
    "expressvpn",
    "tunnel",
    "tap",
    "tun",
    "vpn",
    "virtual",
    "wan miniport",
];

const PROXY_VARS: &[&str] = &["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

const RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NetworkAdapter {
    pub name: String,
    pub is_up: bool,
    pub is_vpn: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DnsConfig {
    pub servers: Vec<String>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EndpointProbe {
    pub hostname: String,
    pub description: String,
    pub resolved: bool,
    pub ip_address: Option<String>,
    /// Port to "connection succeeded"
    pub ports: BTreeMap<u16, bool>,
    pub error: Option<String>,
}

impl EndpointProbe {
    fn open_ports(&self) -> usize {
        self.ports.values().filter(|ok| **ok).count()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkHealth {
    pub platform: String,
    pub adapters: Vec<NetworkAdapter>,
    pub default_adapter: Option<String>,
    pub default_gateway: Option<String>,
    pub dns: Option<DnsConfig>,
    pub proxy_detected: bool,
    pub vpn_adapters: Vec<String>,
    pub endpoints: Vec<EndpointProbe>,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

impl NetworkHealth {
    pub fn vpn_active(&self) -> bool {
        !self.vpn_adapters.is_empty()
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    /// Derive issues and suggestions from the collected facts.
    pub fn analyze(&mut self) {
        if self.vpn_active() {
            self.issues.push(format!(
                "VPN adapter(s) active: {}",
                self.vpn_adapters.join(", ")
            ));
            self.suggestions.push(
                "VPN adapters can cause routing issues. \
                 Disable VPN if experiencing connectivity problems."
                    .to_string(),
            );
        }

        if let Some(dns) = &self.dns {
            if dns.servers.is_empty() {
                self.issues.push("No DNS servers detected".to_string());
                self.suggestions
                    .push("Configure DNS servers (e.g., 8.8.8.8, 1.1.1.1)".to_string());
            } else if dns.servers.iter().any(|s| s == "1.1.1.1") {
                self.issues.push("Using Cloudflare DNS (1.1.1.1)".to_string());
                self.suggestions.push(
                    "Some services may have issues with Cloudflare DNS. \
                     Try Google DNS (8.8.8.8) if problems persist."
                        .to_string(),
                );
            }
        }

        let failed_dns: Vec<&str> = self
            .endpoints
            .iter()
            .filter(|p| !p.resolved)
            .map(|p| p.hostname.as_str())
            .collect();
        let failed_ports: Vec<String> = self
            .endpoints
            .iter()
            .filter(|p| p.resolved)
            .flat_map(|p| {
                p.ports
                    .iter()
                    .filter(|(_, ok)| !**ok)
                    .map(move |(port, _)| format!("{}:{}", p.hostname, port))
            })
            .collect();

        if !failed_dns.is_empty() {
            self.issues
                .push(format!("DNS resolution failed: {}", failed_dns.join(", ")));
            self.suggestions.push(
                "DNS resolution failures indicate network or DNS server issues. \
                 Check DNS configuration and network connectivity."
                    .to_string(),
            );
        }

        if !failed_ports.is_empty() {
            let shown: Vec<&str> = failed_ports.iter().take(5).map(String::as_str).collect();
            self.issues
                .push(format!("Port connectivity failed: {}", shown.join(", ")));
            self.suggestions.push(
                "Port connectivity failures may indicate firewall blocking or routing issues."
                    .to_string(),
            );
        }

        if self.proxy_detected {
            self.issues
                .push("HTTP/HTTPS proxy detected in environment".to_string());
            self.suggestions.push(
                "Proxies can interfere with direct connections. Verify proxy settings.".to_string(),
            );
        }

        if self.default_gateway.is_none() {
            self.issues.push("No default gateway detected".to_string());
            self.suggestions.push(
                "Network may not be properly configured. Check adapter settings.".to_string(),
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    Brief,
    Full,
    Json,
}

/// Render a report. `Json` falls back to `Full` if serialization fails.
pub fn format_report(health: &NetworkHealth, mode: ReportMode) -> String {
    match mode {
        ReportMode::Brief => format_brief(health),
        ReportMode::Full => format_full(health),
        ReportMode::Json => {
            serde_json::to_string_pretty(health).unwrap_or_else(|_| format_full(health))
        }
    }
}

fn format_full(health: &NetworkHealth) -> String {
    let rule = "=".repeat(60);
    let mut lines = vec![
        rule.clone(),
        "NETWORK HEALTH REPORT".to_string(),
        rule.clone(),
        format!("Platform: {}", health.platform),
        String::new(),
        "Network Adapters:".to_string(),
    ];

    for adapter in &health.adapters {
        lines.push(format!(
            "  - {}: {}{}",
            adapter.name,
            if adapter.is_up { "UP" } else { "DOWN" },
            if adapter.is_vpn { " [VPN]" } else { "" }
        ));
    }
    lines.push(String::new());

    if health.default_adapter.is_some() || health.default_gateway.is_some() {
        lines.push(format!(
            "Default Adapter: {}",
            health.default_adapter.as_deref().unwrap_or("N/A")
        ));
        lines.push(format!(
            "Default Gateway: {}",
            health.default_gateway.as_deref().unwrap_or("N/A")
        ));
        lines.push(String::new());
    }

    if let Some(dns) = &health.dns {
        lines.push(format!("DNS Servers ({}):", dns.source));
        lines.extend(dns.servers.iter().map(|s| format!("  - {s}")));
        lines.push(String::new());
    }

    if health.proxy_detected {
        lines.push("Proxy: DETECTED".to_string());
        lines.push(String::new());
    }

    if health.vpn_active() {
        lines.push("VPN Status: ACTIVE".to_string());
        lines.push(format!("VPN Adapters: {}", health.vpn_adapters.join(", ")));
    } else {
        lines.push("VPN Status: INACTIVE".to_string());
    }
    lines.push(String::new());

    lines.push("Endpoint Connectivity:".to_string());
    for probe in &health.endpoints {
        if probe.resolved {
            let marker = match probe.open_ports() {
                n if n == probe.ports.len() => "OK  ",
                0 => "FAIL",
                _ => "WARN",
            };
            let ip = probe
                .ip_address
                .as_deref()
                .map(|ip| format!(" -> {ip}"))
                .unwrap_or_default();
            lines.push(format!("  [{marker}] {}{ip}", probe.hostname));
            for (port, ok) in &probe.ports {
                lines.push(format!(
                    "      Port {port}: {}",
                    if *ok { "OPEN" } else { "CLOSED" }
                ));
            }
        } else {
            lines.push(format!(
                "  [FAIL] {} - {}",
                probe.hostname,
                probe.error.as_deref().unwrap_or("DNS FAILED")
            ));
        }
    }
    lines.push(String::new());

    if !health.issues.is_empty() {
        lines.push("ISSUES DETECTED:".to_string());
        lines.extend(health.issues.iter().map(|i| format!("  * {i}")));
        lines.push(String::new());
    }

    if !health.suggestions.is_empty() {
        lines.push("SUGGESTIONS:".to_string());
        lines.extend(health.suggestions.iter().map(|s| format!("  * {s}")));
        lines.push(String::new());
    }

    lines.push(
        match health.issues.len() {
            0 => "Network health: GOOD",
            1..=2 => "Network health: FAIR (minor issues)",
            _ => "Network health: POOR (multiple issues)",
        }
        .to_string(),
    );
    lines.push(rule);

    lines.join("\n")
}

/// One-paragraph summary suitable for speaking aloud.
fn format_brief(health: &NetworkHealth) -> String {
    let mut parts = Vec::new();

    if let Some(adapter) = &health.default_adapter {
        parts.push(format!("Default network is {adapter}"));
    }
    if let Some(gateway) = &health.default_gateway {
        parts.push(format!("gateway {gateway}"));
    }
    if let Some(dns) = &health.dns
        && !dns.servers.is_empty()
    {
        let shown: Vec<&str> = dns.servers.iter().take(2).map(String::as_str).collect();
        parts.push(format!("DNS: {}", shown.join(", ")));
    }

    if health.vpn_active() {
        parts.push(format!("VPN ACTIVE on {}", health.vpn_adapters.join(", ")));
    } else {
        parts.push("VPN inactive".to_string());
    }

    let total = health.endpoints.len();
    let resolved = health.endpoints.iter().filter(|p| p.resolved).count();
    if resolved == total {
        parts.push(format!("All {total} critical endpoints reachable"));
    } else if resolved > 0 {
        parts.push(format!("{resolved}/{total} endpoints reachable"));
    } else {
        parts.push("NO endpoints reachable".to_string());
    }

    if health.has_issues() {
        parts.push(format!("{} issue(s) detected", health.issues.len()));
    }

    format!("{}.", parts.join(". "))
}

/// Adapters from `ip link show` output.
fn parse_ip_link(output: &str) -> Vec<NetworkAdapter> {
    output
        .lines()
        .filter(|line| !line.starts_with(' '))
        .filter_map(|line| {
            let mut fields = line.splitn(3, ": ");
            let _index = fields.next()?;
            let name = fields.next()?.split('@').next()?.trim().to_string();
            let rest = fields.next().unwrap_or("");

            let flags = rest
                .strip_prefix('<')
                .and_then(|r| r.split_once('>'))
                .map(|(flags, _)| flags)
                .unwrap_or("");
            let is_up = flags.split(',').any(|f| f == "UP");
            let lower = name.to_lowercase();
            let is_vpn = VPN_PATTERNS.iter().any(|p| lower.contains(p));

            Some(NetworkAdapter { name, is_up, is_vpn })
        })
        .collect()
}

/// (adapter, gateway) from `ip route show default` output.
fn parse_default_route(output: &str) -> (Option<String>, Option<String>) {
    let Some(line) = output.lines().find(|l| l.starts_with("default")) else {
        return (None, None);
    };
    let parts: Vec<&str> = line.split_whitespace().collect();
    let after = |key: &str| {
        parts
            .iter()
            .position(|p| *p == key)
            .and_then(|i| parts.get(i + 1))
            .map(|s| s.to_string())
    };
    (after("dev"), after("via"))
}

fn parse_resolv_conf(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("nameserver"))
        .filter_map(|l| l.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// Collects network facts and probes the critical endpoints.
pub struct NetworkHealthChecker {
    endpoints: Vec<(String, Vec<u16>, String)>,
    dns_timeout: Duration,
    connect_timeout: Duration,
}

impl Default for NetworkHealthChecker {
    fn default() -> Self {
        Self {
            endpoints: CRITICAL_ENDPOINTS
                .iter()
                .map(|(host, ports, desc)| (host.to_string(), ports.to_vec(), desc.to_string()))
                .collect(),
            dns_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(4),
        }
    }
}

impl NetworkHealthChecker {
    pub async fn check(&self) -> NetworkHealth {
        dual_info!("Starting network health check");

        let mut health = NetworkHealth {
            platform: std::env::consts::OS.to_string(),
            ..NetworkHealth::default()
        };

        health.adapters = match run_command("ip", &["link", "show"]).await {
            Some(output) => parse_ip_link(&output),
            None => Vec::new(),
        };
        (health.default_adapter, health.default_gateway) =
            match run_command("ip", &["route", "show", "default"]).await {
                Some(output) => parse_default_route(&output),
                None => (None, None),
            };
        health.vpn_adapters = health
            .adapters
            .iter()
            .filter(|a| a.is_vpn && a.is_up)
            .map(|a| a.name.clone())
            .collect();
        for name in &health.vpn_adapters {
            dual_warn!("VPN adapter detected: {}", name);
        }

        health.dns = Some(read_dns_config(Path::new(RESOLV_CONF)).await);
        health.proxy_detected = proxy_detected(|v| std::env::var(v).ok());

        health.endpoints = join_all(
            self.endpoints
                .iter()
                .map(|(host, ports, desc)| self.probe(host, ports, desc)),
        )
        .await;

        health.analyze();
        dual_info!(
            "Network health check completed: {} issues",
            health.issues.len()
        );

        health
    }

    async fn probe(&self, hostname: &str, ports: &[u16], description: &str) -> EndpointProbe {
        let mut probe = EndpointProbe {
            hostname: hostname.to_string(),
            description: description.to_string(),
            resolved: false,
            ip_address: None,
            ports: BTreeMap::new(),
            error: None,
        };

        let lookup = tokio::time::timeout(
            self.dns_timeout,
            tokio::net::lookup_host((hostname, 0u16)),
        )
        .await;
        let addr = match lookup {
            Ok(Ok(mut addrs)) => addrs.next(),
            Ok(Err(e)) => {
                probe.error = Some(format!("DNS resolution failed: {e}"));
                None
            }
            Err(_) => {
                probe.error = Some("DNS resolution timeout".to_string());
                None
            }
        };
        let Some(addr) = addr else {
            if probe.error.is_none() {
                probe.error = Some("DNS resolution returned no addresses".to_string());
            }
            dual_warn!("{} - {}", hostname, probe.error.as_deref().unwrap_or(""));
            return probe;
        };

        probe.resolved = true;
        probe.ip_address = Some(addr.ip().to_string());
        dual_debug!("{} resolved to {}", hostname, addr.ip());

        let connects = ports.iter().map(|port| {
            let target = (addr.ip(), *port);
            async move {
                let ok = matches!(
                    tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await,
                    Ok(Ok(_))
                );
                (*port, ok)
            }
        });
        for (port, ok) in join_all(connects).await {
            if !ok {
                dual_warn!("{}:{} - CLOSED/FILTERED", hostname, port);
            }
            probe.ports.insert(port, ok);
        }

        probe
    }
}

async fn run_command(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output().await {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            dual_warn!("{} {:?} exited with {}", program, args, output.status);
            None
        }
        Err(e) => {
            dual_warn!("Failed to run {} {:?}: {}", program, args, e);
            None
        }
    }
}

async fn read_dns_config(path: &Path) -> DnsConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => DnsConfig {
            servers: parse_resolv_conf(&content),
            source: path.display().to_string(),
        },
        Err(e) => {
            dual_warn!("Could not read {}: {}", path.display(), e);
            DnsConfig {
                servers: Vec::new(),
                source: "unavailable".to_string(),
            }
        }
    }
}

fn proxy_detected(lookup: impl Fn(&str) -> Option<String>) -> bool {
    PROXY_VARS
        .iter()
        .any(|var| lookup(var).is_some_and(|v| !v.trim().is_empty()))
}

#[derive(Default)]
pub struct NetworkHealthTool {
    checker: NetworkHealthChecker,
}

#[async_trait]
impl Tool for NetworkHealthTool {
    fn name(&self) -> &str {
        "check_network_health"
    }

    fn description(&self) -> &str {
        "Check network health: VPN interference, DNS problems, routing issues and \
         connectivity to the services the assistant depends on."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _input: Value) -> ToolResult<String> {
        let health = self.checker.check().await;
        if health.endpoints.is_empty() {
            return Err(ToolError::Unavailable(
                "network health check failed: no endpoints probed".into(),
            ));
        }

        let mut result = format_brief(&health);
        if health.has_issues() {
            let shown: Vec<&str> = health.issues.iter().take(3).map(String::as_str).collect();
            result.push_str(&format!("\n\nIssues: {}", shown.join("; ")));
        }
        if let Some(suggestion) = health.suggestions.first() {
            result.push_str(&format!("\n\nSuggestion: {suggestion}"));
        }

        Ok(result)
    }
}

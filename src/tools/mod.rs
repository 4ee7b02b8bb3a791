//! Single-call utility tools exposed to the session.
//!
//! Every tool returns a user-facing string. Failures never propagate past
//! [`ToolRegistry::invoke`]; they are rendered as `error: <reason>` so the
//! conversation can carry on.

mod email;
mod net_health;
mod password;
mod search;
mod shutdown;
mod weather;

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use email::SendEmailTool;
pub use net_health::{NetworkHealthChecker, NetworkHealthTool, ReportMode, format_report};
pub use password::GeneratePasswordTool;
pub use search::SearchWebTool;
pub use shutdown::ShutdownTool;
pub use weather::WeatherTool;

use crate::{config::Config, dual_info, dual_warn, memory::MemoryManager};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{what} timed out after {secs} seconds")]
    Timeout { what: String, secs: u64 },

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{what} returned status {status}")]
    Upstream { what: String, status: u16 },
}

pub type ToolResult<T> = Result<T, ToolError>;

/// JSON Schema for tool parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name, as used by `/tool <name>`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for input parameters.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, input: Value) -> ToolResult<String>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Bound `fut` by `secs`, turning an elapsed deadline into [`ToolError::Timeout`].
pub async fn with_timeout<T, F>(what: impl Into<String>, secs: u64, fut: F) -> ToolResult<T>
where
    F: Future<Output = ToolResult<T>>,
{
    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(result) => result,
        Err(_) => Err(ToolError::Timeout {
            what: what.into(),
            secs,
        }),
    }
}

/// Deserialize tool input, mapping shape errors to [`ToolError::InvalidInput`].
pub(crate) fn parse_input<T: serde::de::DeserializeOwned>(input: Value) -> ToolResult<T> {
    serde_json::from_value(input).map_err(|e| ToolError::InvalidInput(format!("invalid input: {e}")))
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in tool. `stop` is cancelled by `shutdown_agent`.
    pub fn with_defaults(
        config: &Config,
        memory: Arc<Mutex<MemoryManager>>,
        stop: CancellationToken,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(WeatherTool::new(config.tools.weather_timeout_secs));
        registry.register(SearchWebTool::new(
            config.tools.search_timeout_secs,
            config.tools.search_max_chars,
        ));
        registry.register(SendEmailTool::from_config(&config.tools));
        registry.register(NetworkHealthTool::default());
        registry.register(GeneratePasswordTool::new(&config.tools.password_file));
        registry.register(ShutdownTool::new(
            memory,
            config.session.goodbye_message.clone(),
            stop,
        ));
        registry
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    /// Run a tool by name. Always yields a string for the user.
    pub async fn invoke(&self, name: &str, input: Value) -> String {
        let Some(tool) = self.get(name) else {
            return format!("error: unknown tool '{name}'");
        };

        dual_info!("Invoking tool {}", name);
        match tool.execute(input).await {
            Ok(output) => output,
            Err(e) => {
                dual_warn!("Tool {} failed: {}", name, e);
                format!("error: {e}")
            }
        }
    }
}

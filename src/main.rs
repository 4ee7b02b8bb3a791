mod config;
mod error;
mod keys;
mod memory;
mod session;
mod tools;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::{
    config::{Config, LogConfig, MemoryConfig},
    keys::{KeyRotator, MemoryIndexStore, QuotaPolicy},
    memory::{ExtractingBackend, FallbackSpool, FlushOutcome, MemoryManager, fallback::SpooledSession},
    session::AgentSession,
    tools::{NetworkHealthChecker, ReportMode, ToolRegistry, format_report},
};

#[macro_export]
macro_rules! dual_debug {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::debug!(target: "stdout", "{}", message);
        tracing::debug!(target: "file", "{}", message);
    }};
}

#[macro_export]
macro_rules! dual_info {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::info!(target: "stdout", "{}", message);
        tracing::info!(target: "file", "{}", message);
    }};
}

#[macro_export]
macro_rules! dual_warn {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::warn!(target: "stdout", "{}", message);
        tracing::warn!(target: "file", "{}", message);
    }};
}

#[macro_export]
macro_rules! dual_error {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(target: "stdout", "{}", message);
        tracing::error!(target: "file", "{}", message);
    }};
}

#[derive(Debug, Parser)]
#[command(name = "astro", version, about = "ASTRO voice assistant core")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start an interactive session (default)
    Run,
    /// Inspect or move the memory credential cursor
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
    /// Work with stored memories and the fallback spool
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Diagnose network problems that affect the assistant's services
    NetHealth(NetHealthArgs),
    /// Run a single tool and print its output
    Tool {
        name: String,
        /// Tool arguments as a JSON object
        args: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum KeysCommand {
    /// Show the configured credentials and the active one
    Status,
    /// Go back to the first credential
    Reset,
    /// Move to the next credential
    Advance,
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    /// List sessions waiting in the fallback spool
    Pending,
    /// Save spooled sessions and remove the ones that succeed
    Replay,
    /// Search stored memories
    Search {
        query: String,
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },
}

#[derive(Debug, Args)]
struct NetHealthArgs {
    /// One-paragraph summary
    #[arg(long, conflicts_with = "json")]
    brief: bool,
    /// Machine-readable report
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let _guard = init_logging(&config.log)?;

    dual_debug!("Loaded configuration from {}", cli.config.display());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_session(config).await?,
        Command::Keys { command } => run_keys(&config, command)?,
        Command::Memory { command } => run_memory(config, command).await?,
        Command::NetHealth(args) => return Ok(run_net_health(args).await),
        Command::Tool { name, args } => run_tool(config, &name, args.as_deref()).await?,
    }

    Ok(ExitCode::SUCCESS)
}

/// Console events go to stderr so command output on stdout stays clean.
fn init_logging(config: &LogConfig) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("Failed to create log directory {}", config.dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&config.dir, &config.file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(Targets::new().with_target("stdout", tracing::Level::TRACE)),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .with_filter(Targets::new().with_target("file", tracing::Level::TRACE)),
        )
        .init();

    Ok(guard)
}

/// Missing credentials are fatal only when memory is enabled.
fn build_memory(config: &Config) -> anyhow::Result<MemoryManager> {
    if !config.memory.enabled {
        dual_info!("Memory disabled, skipping credential setup");
        return Ok(detached_memory(config));
    }

    Ok(MemoryManager::new(
        config.memory.clone(),
        Arc::new(ExtractingBackend::from_config(&config.memory)),
        KeyRotator::from_config(&config.keys)?,
        QuotaPolicy::from_config(&config.keys.quota),
    ))
}

/// Disabled manager for runs that never record a conversation; needs no credentials.
fn detached_memory(config: &Config) -> MemoryManager {
    let memory = MemoryConfig {
        enabled: false,
        ..config.memory.clone()
    };

    MemoryManager::new(
        memory.clone(),
        Arc::new(ExtractingBackend::from_config(&memory)),
        KeyRotator::new(Vec::new(), Box::new(MemoryIndexStore::default())),
        QuotaPolicy::from_config(&config.keys.quota),
    )
}

/// Registry for the one-shot `tool` command.
fn standalone_tools(config: &Config) -> ToolRegistry {
    let memory = Arc::new(Mutex::new(detached_memory(config)));
    ToolRegistry::with_defaults(config, memory, CancellationToken::new())
}

async fn run_session(config: Config) -> anyhow::Result<()> {
    let memory = Arc::new(Mutex::new(build_memory(&config)?));
    let stop = CancellationToken::new();
    let tools = ToolRegistry::with_defaults(&config, memory.clone(), stop.clone());

    dual_info!("Tools available: {}", tools.names().join(", "));

    let session = AgentSession::new(config.session.clone(), memory, tools, stop);
    session.run().await?;

    Ok(())
}

fn run_keys(config: &Config, command: KeysCommand) -> anyhow::Result<()> {
    let mut rotator = KeyRotator::from_config(&config.keys)?;

    match command {
        KeysCommand::Status => {}
        KeysCommand::Reset => rotator.reset(),
        KeysCommand::Advance => {
            let credential = rotator.rotate()?;
            println!("Now using {credential}");
        }
    }

    print!("{}", rotator.status());
    Ok(())
}

async fn run_memory(config: Config, command: MemoryCommand) -> anyhow::Result<()> {
    let spool = FallbackSpool::new(&config.memory.fallback_dir);

    match command {
        MemoryCommand::Pending => {
            let pending = spool.pending()?;
            if pending.is_empty() {
                println!("No spooled sessions in {}", spool.dir().display());
            }
            for path in pending {
                match FallbackSpool::read(&path) {
                    Ok(session) => println!(
                        "{} [{}] {} turns: {}",
                        path.display(),
                        session.saved_at.to_rfc3339(),
                        session.turns.len(),
                        session.reason
                    ),
                    Err(e) => println!("{} (unreadable: {e})", path.display()),
                }
            }
        }
        MemoryCommand::Replay => {
            let mut manager = build_memory(&config)?;
            let pending = spool.pending()?;
            let total = pending.len();
            let mut replayed = 0;

            for path in pending {
                let session: SpooledSession = FallbackSpool::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;

                match manager.replay(&session).await {
                    Ok(FlushOutcome::Saved { extracted, .. }) => {
                        std::fs::remove_file(&path)?;
                        replayed += 1;
                        println!("{}: {} memories extracted", path.display(), extracted);
                    }
                    Ok(outcome) => println!("{}: skipped ({outcome:?})", path.display()),
                    Err(e) => {
                        // later sessions would hit the same credentials
                        dual_error!("Replay of {} failed: {}", path.display(), e);
                        break;
                    }
                }
            }

            println!("Replayed {replayed} of {total} spooled sessions");
        }
        MemoryCommand::Search { query, limit } => {
            let manager = build_memory(&config)?;
            let records = manager.search(&query, limit).await?;
            if records.is_empty() {
                println!("No memories match '{query}'");
            }
            for (i, record) in records.iter().enumerate() {
                println!(
                    "{}. [{}] {}",
                    i + 1,
                    record.metadata.created_at.to_rfc3339(),
                    record.memory
                );
            }
        }
    }

    Ok(())
}

async fn run_net_health(args: NetHealthArgs) -> ExitCode {
    let mode = if args.json {
        ReportMode::Json
    } else if args.brief {
        ReportMode::Brief
    } else {
        ReportMode::Full
    };

    let health = NetworkHealthChecker::default().check().await;
    println!("{}", format_report(&health, mode));

    if health.has_issues() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_tool(config: Config, name: &str, args: Option<&str>) -> anyhow::Result<()> {
    let input = match args {
        Some(raw) => serde_json::from_str(raw).context("Tool arguments must be a JSON object")?,
        None => serde_json::json!({}),
    };

    let tools = standalone_tools(&config);

    println!("{}", tools.invoke(name, input).await);
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_tool_command_needs_no_memory_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.keys.env_prefix = "ASTRO_TEST_UNSET_MEMORY_KEY".to_string();
        config.tools.password_file = dir.path().join("passwords.txt");

        // a session would refuse to start without keys
        assert!(config.memory.enabled);
        assert!(build_memory(&config).is_err());

        let tools = standalone_tools(&config);
        let password = tools
            .invoke("generate_password", json!({ "length": 8 }))
            .await;
        assert_eq!(password.chars().count(), 8);
    }

    #[test]
    fn test_detached_memory_is_disabled() {
        let config = Config::default();
        let memory = detached_memory(&config);
        assert!(!memory.is_enabled());
        assert!(memory.rotator().is_empty());
    }
}

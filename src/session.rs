//! Text-mode agent session.
//!
//! Reads one utterance per line from stdin, records it in the memory buffer
//! and dispatches `/` commands to the tool registry. A configured shutdown
//! phrase, `/quit`, end of input or Ctrl-C ends the session through the
//! `shutdown_agent` tool so memory is flushed exactly once.

use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SessionConfig,
    dual_debug, dual_error, dual_info, dual_warn,
    error::AgentResult,
    memory::{FlushOutcome, MemoryManager, MessageRole},
    tools::ToolRegistry,
};

const SHUTDOWN_TOOL: &str = "shutdown_agent";

const HELP: &str = "\
Commands:
  /tool <name> [json]   run a tool, e.g. /tool get_weather {\"city\": \"Paris\"}
  /tools                list available tools
  /flush                save buffered turns to memory now
  /quit                 flush memory and exit
Anything else is recorded as something you said.";

/// A parsed line of input.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Empty,
    Utterance(String),
    Tool { name: String, args: Value },
    ListTools,
    Flush,
    Quit,
    Help,
}

/// Parse one input line. Errors are user-facing messages.
pub fn parse_line(line: &str) -> Result<Input, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Utterance(line.to_string()));
    };

    let (head, rest) = match command.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (command, ""),
    };

    match head {
        "tool" => {
            let (name, raw_args) = match rest.split_once(char::is_whitespace) {
                Some((name, args)) => (name, args.trim()),
                None => (rest, ""),
            };
            if name.is_empty() {
                return Err("usage: /tool <name> [json]".to_string());
            }
            let args = if raw_args.is_empty() {
                json!({})
            } else {
                serde_json::from_str(raw_args)
                    .map_err(|e| format!("invalid tool arguments: {e}"))?
            };
            Ok(Input::Tool {
                name: name.to_string(),
                args,
            })
        }
        "tools" => Ok(Input::ListTools),
        "flush" => Ok(Input::Flush),
        "quit" | "exit" => Ok(Input::Quit),
        "help" => Ok(Input::Help),
        other => Err(format!("unknown command '/{other}', try /help")),
    }
}

/// Case-insensitive substring match against the configured phrases.
pub fn is_shutdown_phrase(text: &str, phrases: &[String]) -> bool {
    let text = text.to_lowercase();
    phrases
        .iter()
        .map(|p| p.trim().to_lowercase())
        .any(|p| !p.is_empty() && text.contains(&p))
}

pub struct AgentSession {
    config: SessionConfig,
    memory: Arc<Mutex<MemoryManager>>,
    tools: ToolRegistry,
    stop: CancellationToken,
}

impl AgentSession {
    /// `stop` must be the token the registry's shutdown tool cancels.
    pub fn new(
        config: SessionConfig,
        memory: Arc<Mutex<MemoryManager>>,
        tools: ToolRegistry,
        stop: CancellationToken,
    ) -> Self {
        Self {
            config,
            memory,
            tools,
            stop,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Load memories and return the context injected at session start.
    pub async fn start(&self) -> String {
        let mut memory = self.memory.lock().await;
        memory.initialize().await;
        dual_info!(
            "Session {} started with {} memories",
            memory.session_id(),
            memory.loaded_memories().len()
        );
        memory.loaded_context()
    }

    /// Handle one line of input and return what the assistant says, if anything.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let input = match parse_line(line) {
            Ok(input) => input,
            Err(message) => return Some(message),
        };

        match input {
            Input::Empty => None,
            Input::Help => Some(HELP.to_string()),
            Input::ListTools => Some(
                self.tools
                    .schemas()
                    .iter()
                    .map(|s| format!("{}: {}", s.name, s.description))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            Input::Utterance(text) => {
                self.memory.lock().await.record(MessageRole::User, &text);
                if is_shutdown_phrase(&text, &self.config.shutdown_phrases) {
                    dual_info!("Shutdown phrase detected");
                    return Some(self.shutdown().await);
                }
                None
            }
            Input::Tool { name, args } => {
                if name == SHUTDOWN_TOOL {
                    return Some(self.shutdown().await);
                }
                // the memory lock is not held while a tool runs
                let output = self.tools.invoke(&name, args).await;
                self.memory
                    .lock()
                    .await
                    .record(MessageRole::Assistant, &output);
                Some(output)
            }
            Input::Flush => Some(self.flush().await),
            Input::Quit => Some(self.shutdown().await),
        }
    }

    async fn flush(&self) -> String {
        let timeout = Duration::from_secs(self.config.flush_timeout_secs);
        let result = tokio::time::timeout(timeout, async {
            self.memory.lock().await.flush().await
        })
        .await;

        match result {
            Ok(Ok(FlushOutcome::Saved { turns, extracted, .. })) => {
                format!("saved {turns} turns ({extracted} memories extracted)")
            }
            Ok(Ok(FlushOutcome::Empty)) => "nothing to save".to_string(),
            Ok(Ok(FlushOutcome::Disabled)) => "memory is disabled".to_string(),
            Ok(Err(e)) => format!("error: {e}"),
            Err(_) => {
                dual_warn!(
                    "Memory flush timed out after {} seconds",
                    self.config.flush_timeout_secs
                );
                format!(
                    "error: memory flush timed out after {} seconds",
                    self.config.flush_timeout_secs
                )
            }
        }
    }

    /// Run the shutdown tool, bounded by the flush timeout. The session stops
    /// whether or not the flush finished in time.
    async fn shutdown(&self) -> String {
        let timeout = Duration::from_secs(self.config.flush_timeout_secs);
        match tokio::time::timeout(timeout, self.tools.invoke(SHUTDOWN_TOOL, json!({}))).await {
            Ok(goodbye) => {
                self.stop.cancel();
                goodbye
            }
            Err(_) => {
                dual_error!(
                    "Shutdown did not finish within {} seconds",
                    self.config.flush_timeout_secs
                );
                self.stop.cancel();
                self.config.goodbye_message.clone()
            }
        }
    }

    /// Read stdin until the session is stopped.
    pub async fn run(&self) -> AgentResult<()> {
        let context = self.start().await;
        if !context.is_empty() {
            println!("{context}\n");
        }
        println!("Session ready. Type /help for commands.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while !self.is_stopped() {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::signal::ctrl_c() => {
                    dual_info!("Interrupted, shutting down");
                    println!("{}", self.shutdown().await);
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        dual_debug!("Input: {}", line);
                        if let Some(reply) = self.handle_line(&line).await {
                            println!("{reply}");
                        }
                    }
                    None => {
                        dual_info!("End of input, shutting down");
                        println!("{}", self.shutdown().await);
                    }
                },
            }
        }

        dual_info!("Session ended");
        Ok(())
    }
}

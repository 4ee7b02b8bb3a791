use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolResult};
use crate::{dual_info, dual_warn, memory::MemoryManager};

/// Ends the session: flushes memory, closes the backend and signals the
/// session loop to stop once the goodbye has been delivered.
pub struct ShutdownTool {
    memory: Arc<Mutex<MemoryManager>>,
    goodbye: String,
    stop: CancellationToken,
}

impl ShutdownTool {
    pub fn new(
        memory: Arc<Mutex<MemoryManager>>,
        goodbye: impl Into<String>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            memory,
            goodbye: goodbye.into(),
            stop,
        }
    }
}

#[async_trait]
impl Tool for ShutdownTool {
    fn name(&self) -> &str {
        "shutdown_agent"
    }

    fn description(&self) -> &str {
        "Shut the assistant down when the user explicitly asks to end the session."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _input: Value) -> ToolResult<String> {
        dual_info!("User requested shutdown");

        // the goodbye is delivered even if the flush fails; the buffer stays
        // spooled or in memory and the failure is already logged
        match self.memory.lock().await.shutdown().await {
            Ok(outcome) => dual_info!("Memory flushed before shutdown: {:?}", outcome),
            Err(e) => dual_warn!("Memory flush failed during shutdown: {}", e),
        }

        self.stop.cancel();
        Ok(self.goodbye.clone())
    }
}

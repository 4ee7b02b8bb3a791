use thiserror::Error;

use crate::{keys::KeyError, memory::MemoryError};

/// Errors that may stop the agent from starting or a CLI command from completing.
///
/// Nothing in here is raised once a session is running: tool failures are turned
/// into strings and memory flush failures are logged.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Key(#[from] KeyError),
    #[error("{0}")]
    Memory(#[from] MemoryError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Operation(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

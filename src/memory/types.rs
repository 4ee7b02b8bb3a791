use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::KeyError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    /// Only user and assistant turns carry anything worth remembering.
    pub fn is_conversational(&self) -> bool {
        matches!(self, MessageRole::User | MessageRole::Assistant)
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            "tool" => Ok(MessageRole::Tool),
            _ => Err(MemoryError::InvalidData(format!("Invalid message role: {s}"))),
        }
    }
}

/// One buffered conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Extracted fact, preference or event
    #[default]
    Memory,
    /// Raw chat dump; never injected back into a session
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryMetadata {
    #[serde(default)]
    pub kind: MemoryKind,
    #[serde(default)]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub estimated_tokens: usize,
}

/// A stored memory as kept by the collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    pub memory: String,
    pub metadata: MemoryMetadata,
}

/// Describes the session being flushed; attached to every record it produces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlushMetadata {
    pub session_id: String,
    pub extracted_at: DateTime<Utc>,
    pub message_count: usize,
    pub estimated_tokens: usize,
}

/// Result of a successful backend save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReceipt {
    /// Number of memories extracted from the turns; zero for trivial conversations
    pub extracted: usize,
}

/// Failure reported by the backend's save call.
///
/// Whether it is retriable with another credential is decided by
/// [`crate::keys::QuotaPolicy`], from the status and the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SaveError {
    pub status: Option<u16>,
    pub message: String,
}

impl SaveError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Memory manager lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryState {
    Idle,
    Loading,
    Ready,
    Buffering,
    Flushing,
    ShutDown,
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MemoryState::Idle => "idle",
            MemoryState::Loading => "loading",
            MemoryState::Ready => "ready",
            MemoryState::Buffering => "buffering",
            MemoryState::Flushing => "flushing",
            MemoryState::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

/// What a completed flush did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Memory system disabled by configuration
    Disabled,
    /// Nothing buffered; the backend was not called
    Empty,
    Saved {
        turns: usize,
        extracted: usize,
        attempts: usize,
        /// Zero-based index of the credential that succeeded
        credential_index: usize,
    },
}

/// Why a flush did not complete. The session buffer is left intact in every case.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlushFailure {
    #[error(transparent)]
    Credentials(#[from] KeyError),

    #[error("backend error: {0}")]
    Backend(SaveError),

    /// The backend answered but nothing could be extracted from a
    /// conversation long enough to contain something.
    #[error("no memories extracted from {turns} turns")]
    EmptyExtraction { turns: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory flush failed: {0}")]
    FlushFailed(#[from] FlushFailure),

    #[error("Failed to load memories: {0}")]
    LoadFailed(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

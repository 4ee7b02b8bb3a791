pub mod index_store;
pub mod quota;
pub mod rotator;

pub use index_store::{FileIndexStore, IndexStore, MemoryIndexStore};
pub use quota::QuotaPolicy;
pub use rotator::{Credential, KeyRotator, KeyStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("No API credentials available")]
    NoCredentialsAvailable,

    #[error("All {total} API credentials have been exhausted")]
    AllCredentialsExhausted { total: usize },
}

pub type KeyResult<T> = Result<T, KeyError>;

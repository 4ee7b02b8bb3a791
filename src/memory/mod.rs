pub mod backend;
pub mod extractor;
pub mod fallback;
pub mod manager;
pub mod store;
pub mod types;

pub use backend::{ExtractingBackend, MemoryBackend};
pub use fallback::FallbackSpool;
pub use manager::MemoryManager;
pub use types::*;

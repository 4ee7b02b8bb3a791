use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    config::MemoryConfig,
    dual_info,
    keys::Credential,
    memory::{
        extractor::MemoryExtractor,
        store::MemoryCollection,
        types::{
            FlushMetadata, MemoryKind, MemoryMetadata, MemoryRecord, MemoryResult, SaveError,
            SaveReceipt, Turn,
        },
    },
};

/// Long-term memory storage as seen by the [`MemoryManager`](super::MemoryManager).
///
/// `save` receives the credential to use for this attempt; classifying its
/// errors and rotating to another credential is the manager's job.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Every stored record for `user_id`, oldest first.
    async fn load(&self, user_id: &str) -> MemoryResult<Vec<MemoryRecord>>;

    async fn save(
        &self,
        user_id: &str,
        turns: &[Turn],
        metadata: &FlushMetadata,
        credential: &Credential,
    ) -> Result<SaveReceipt, SaveError>;

    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> MemoryResult<Vec<MemoryRecord>>;

    async fn close(&self) -> MemoryResult<()>;
}

/// Extracts memories with a chat model and keeps them in a local collection.
pub struct ExtractingBackend {
    extractor: MemoryExtractor,
    collection: MemoryCollection,
}

impl ExtractingBackend {
    pub fn new(extractor: MemoryExtractor, collection: MemoryCollection) -> Self {
        Self {
            extractor,
            collection,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(
            MemoryExtractor::from_config(config),
            MemoryCollection::new(&config.store_path, &config.collection_name),
        )
    }
}

#[async_trait]
impl MemoryBackend for ExtractingBackend {
    async fn load(&self, user_id: &str) -> MemoryResult<Vec<MemoryRecord>> {
        self.collection.load(user_id).await
    }

    async fn save(
        &self,
        user_id: &str,
        turns: &[Turn],
        metadata: &FlushMetadata,
        credential: &Credential,
    ) -> Result<SaveReceipt, SaveError> {
        let memories = self.extractor.extract(turns, credential).await?;

        let records: Vec<MemoryRecord> = memories
            .into_iter()
            .map(|memory| MemoryRecord {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                memory,
                metadata: MemoryMetadata {
                    kind: MemoryKind::Memory,
                    session_id: Some(metadata.session_id.clone()),
                    created_at: metadata.extracted_at,
                    message_count: metadata.message_count,
                    estimated_tokens: metadata.estimated_tokens,
                },
            })
            .collect();

        self.collection
            .append(&records)
            .await
            .map_err(|e| SaveError::new(format!("Failed to store extracted memories: {e}")))?;

        dual_info!(
            "Stored {} memories for session {}",
            records.len(),
            metadata.session_id
        );

        Ok(SaveReceipt {
            extracted: records.len(),
        })
    }

    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> MemoryResult<Vec<MemoryRecord>> {
        self.collection.search(user_id, query, limit).await
    }

    async fn close(&self) -> MemoryResult<()> {
        self.collection.close().await;
        Ok(())
    }
}

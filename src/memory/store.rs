use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::{
    dual_debug, dual_warn,
    memory::types::{MemoryError, MemoryRecord, MemoryResult},
};

/// Append-only collection of memory records, one JSON object per line in
/// `<store_path>/<collection>.jsonl`.
///
/// Writes are serialized through an internal lock. Lines that fail to parse
/// are skipped on read instead of failing the whole load.
pub struct MemoryCollection {
    path: PathBuf,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl MemoryCollection {
    pub fn new(store_path: impl AsRef<Path>, collection_name: &str) -> Self {
        Self {
            path: store_path.as_ref().join(format!("{collection_name}.jsonl")),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records belonging to `user_id`, oldest first.
    pub async fn load(&self, user_id: &str) -> MemoryResult<Vec<MemoryRecord>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<MemoryRecord>(line) {
                Ok(record) if record.user_id == user_id => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    dual_debug!("Skipping unreadable memory record: {}", e);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            dual_warn!(
                "Skipped {} corrupted memory records in {}",
                skipped,
                self.path.display()
            );
        }

        records.sort_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at));

        Ok(records)
    }

    pub async fn append(&self, records: &[MemoryRecord]) -> MemoryResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MemoryError::InvalidData(format!(
                "collection {} is closed",
                self.path.display()
            )));
        }
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Rank the user's records by how many distinct query terms they contain.
    /// Ties go to the more recent record.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> MemoryResult<Vec<MemoryRecord>> {
        let terms = tokenize(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, MemoryRecord)> = self
            .load(user_id)
            .await?
            .into_iter()
            .filter_map(|record| {
                let words = tokenize(&record.memory);
                let score = terms.intersection(&words).count();
                (score > 0).then_some((score, record))
            })
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.cmp(sa)
                .then_with(|| b.metadata.created_at.cmp(&a.metadata.created_at))
        });

        Ok(scored.into_iter().take(limit).map(|(_, r)| r).collect())
    }

    /// Refuse further writes. Reads stay available.
    pub async fn close(&self) {
        let _guard = self.write_lock.lock().await;
        self.closed.store(true, Ordering::Release);
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::memory::types::{MemoryKind, MemoryMetadata};

    fn record(id: &str, user: &str, text: &str, age_minutes: i64) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            memory: text.to_string(),
            metadata: MemoryMetadata {
                kind: MemoryKind::Memory,
                session_id: Some("s1".to_string()),
                created_at: Utc::now() - Duration::minutes(age_minutes),
                message_count: 2,
                estimated_tokens: 10,
            },
        }
    }

    #[tokio::test]
    async fn test_missing_collection_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let collection = MemoryCollection::new(dir.path(), "mem");
        assert!(collection.load("ada").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_and_load_filters_by_user() {
        let dir = tempfile::tempdir().unwrap();
        let collection = MemoryCollection::new(dir.path().join("db"), "mem");

        collection
            .append(&[
                record("1", "ada", "Likes tea", 5),
                record("2", "bob", "Likes coffee", 4),
            ])
            .await
            .unwrap();
        collection
            .append(&[record("3", "ada", "Lives in Lyon", 1)])
            .await
            .unwrap();

        let loaded = collection.load("ada").await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_corrupted_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let collection = MemoryCollection::new(dir.path(), "mem");
        collection
            .append(&[record("1", "ada", "Likes tea", 1)])
            .await
            .unwrap();

        let mut content = std::fs::read_to_string(collection.path()).unwrap();
        content.push_str("\"just a string\"\n{broken\n");
        std::fs::write(collection.path(), content).unwrap();

        assert_eq!(collection.load("ada").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_ranks_by_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let collection = MemoryCollection::new(dir.path(), "mem");
        collection
            .append(&[
                record("1", "ada", "Job interview on Friday at Acme", 30),
                record("2", "ada", "Prefers tea over coffee", 20),
                record("3", "ada", "Interview prep: review Rust", 10),
            ])
            .await
            .unwrap();

        let hits = collection.search("ada", "Friday interview", 5).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);

        assert_eq!(collection.search("ada", "interview", 1).await.unwrap()[0].id, "3");
        assert!(collection.search("ada", "", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_collection_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let collection = MemoryCollection::new(dir.path(), "mem");
        collection.close().await;

        assert!(
            collection
                .append(&[record("1", "ada", "Likes tea", 1)])
                .await
                .is_err()
        );
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    config::MemoryConfig,
    dual_debug, dual_error, dual_info, dual_warn,
    keys::{KeyError, KeyRotator, QuotaPolicy},
    memory::{
        backend::MemoryBackend,
        fallback::{FallbackSpool, SpooledSession},
        types::*,
    },
};

/// Number of loaded memories rendered into the session context.
const CONTEXT_MEMORIES: usize = 10;

/// Conversations longer than this are expected to yield at least one memory.
const EMPTY_EXTRACTION_TURNS: usize = 2;

/// Session memory manager
///
/// Buffers the conversational turns of one session and hands them to the
/// [`MemoryBackend`] for extraction when the session is flushed, typically at
/// shutdown. Past memories are loaded once at startup and exposed as a
/// formatted context block.
///
/// # Credential handling
/// Each save attempt uses the rotator's current credential. When the backend
/// answers with a quota error the manager rotates to the next credential and
/// retries, for at most as many attempts as there are credentials. Any other
/// error ends the flush immediately. A successful save resets the rotation
/// pass so the next exhaustion episode gets a full cycle again.
///
/// # Failure behaviour
/// A failed flush never drops data: the buffer stays intact so the flush can
/// be retried, even when the flush future is dropped mid-save. When every
/// credential is exhausted, or extraction keeps coming back empty, the raw
/// session is also written to the fallback spool; it is removed again once a
/// later flush of the same session succeeds.
///
/// The manager is not internally synchronized; share it behind an
/// `Arc<tokio::sync::Mutex<_>>` so only one flush can be in flight.
pub struct MemoryManager {
    config: MemoryConfig,
    backend: Arc<dyn MemoryBackend>,
    rotator: KeyRotator,
    quota: QuotaPolicy,
    spool: FallbackSpool,
    state: MemoryState,
    session_id: String,
    session_started: DateTime<Utc>,
    buffer: Vec<Turn>,
    loaded: Vec<MemoryRecord>,
    /// Outcome of the flush that completed shutdown
    final_outcome: Option<FlushOutcome>,
}

impl MemoryManager {
    /// Create a manager in the `Idle` state
    ///
    /// # Parameters
    /// * `config` - Memory settings; `enabled = false` turns every operation into a no-op
    /// * `backend` - Storage used for loading, saving and searching memories
    /// * `rotator` - Credential pool used for save attempts
    /// * `quota` - Predicate deciding which save errors trigger a rotation
    pub fn new(
        config: MemoryConfig,
        backend: Arc<dyn MemoryBackend>,
        rotator: KeyRotator,
        quota: QuotaPolicy,
    ) -> Self {
        let spool = FallbackSpool::new(&config.fallback_dir);
        Self {
            config,
            backend,
            rotator,
            quota,
            spool,
            state: MemoryState::Idle,
            session_id: new_session_id(),
            session_started: Utc::now(),
            buffer: Vec::new(),
            loaded: Vec::new(),
            final_outcome: None,
        }
    }

    pub fn state(&self) -> MemoryState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn buffered(&self) -> &[Turn] {
        &self.buffer
    }

    pub fn loaded_memories(&self) -> &[MemoryRecord] {
        &self.loaded
    }

    pub fn rotator(&self) -> &KeyRotator {
        &self.rotator
    }

    /// Load past memories and move to `Ready`
    ///
    /// # Description
    /// Records of kind `chat` are raw session dumps and are skipped. When
    /// `max_memories_load` is set only the most recent records are kept.
    ///
    /// A backend failure does not stop the session: it is logged and the
    /// manager continues with an empty context.
    pub async fn initialize(&mut self) {
        if self.state != MemoryState::Idle {
            return;
        }

        if !self.config.enabled {
            dual_warn!("Memory system disabled; conversations will not be remembered");
            self.state = MemoryState::Ready;
            return;
        }

        self.state = MemoryState::Loading;
        self.session_started = Utc::now();

        match self.backend.load(&self.config.user_id).await {
            Ok(records) => {
                let total = records.len();
                let mut memories: Vec<MemoryRecord> = records
                    .into_iter()
                    .filter(|r| r.metadata.kind != MemoryKind::Chat)
                    .collect();

                if total > memories.len() {
                    dual_debug!(
                        "Skipped {} raw chat records while loading memories",
                        total - memories.len()
                    );
                }

                if let Some(max) = self.config.max_memories_load
                    && memories.len() > max
                {
                    memories.drain(..memories.len() - max);
                    dual_info!("Limited to {} most recent memories", max);
                }

                dual_info!(
                    "Loaded {} memories for user {}",
                    memories.len(),
                    self.config.user_id
                );
                self.loaded = memories;
            }
            Err(e) => {
                dual_error!("Failed to load past memories, starting with empty context: {}", e);
                self.loaded.clear();
            }
        }

        self.state = MemoryState::Ready;
    }

    /// Render the most recent loaded memories for injection into the agent context
    ///
    /// # Returns
    /// * `String` - Empty when there is nothing to show, otherwise a header line
    ///   followed by `N. [created_at] memory` lines
    pub fn loaded_context(&self) -> String {
        if self.loaded.is_empty() {
            return String::new();
        }

        let start = self.loaded.len().saturating_sub(CONTEXT_MEMORIES);
        let mut lines = vec!["**Past Memories:**".to_string()];
        for (i, record) in self.loaded[start..].iter().enumerate() {
            lines.push(format!(
                "{}. [{}] {}",
                i + 1,
                record.metadata.created_at.to_rfc3339(),
                record.memory
            ));
        }

        lines.join("\n")
    }

    /// Buffer a conversation turn
    ///
    /// # Description
    /// Only user and assistant turns are kept; everything else is ignored, as is
    /// any turn recorded while disabled or after shutdown.
    pub fn record(&mut self, role: MessageRole, content: impl Into<String>) {
        if !self.config.enabled || self.state == MemoryState::ShutDown {
            return;
        }
        if !role.is_conversational() {
            return;
        }

        let content = content.into();
        if content.trim().is_empty() {
            return;
        }

        dual_debug!("Buffered {} turn ({} chars)", role, content.chars().count());
        self.buffer.push(Turn::new(role, content));
        self.state = MemoryState::Buffering;
    }

    /// Flush the buffered turns to the backend
    ///
    /// # Returns
    /// * `Ok(FlushOutcome::Empty)` - Nothing was buffered; the backend was not called
    /// * `Ok(FlushOutcome::Saved { .. })` - Buffer cleared and a new session begun
    ///
    /// # Errors
    /// * `MemoryError::FlushFailed` - The buffer is kept. Credential exhaustion
    ///   and repeated empty extraction additionally write the session to the
    ///   fallback spool.
    pub async fn flush(&mut self) -> MemoryResult<FlushOutcome> {
        if let Some(outcome) = &self.final_outcome {
            return Ok(outcome.clone());
        }
        self.flush_buffer().await
    }

    /// Flush once more, close the backend and move to `ShutDown`
    ///
    /// # Description
    /// After a successful shutdown further calls return the same outcome
    /// without touching the backend. If the final flush fails the manager
    /// stays open so shutdown can be attempted again.
    pub async fn shutdown(&mut self) -> MemoryResult<FlushOutcome> {
        if let Some(outcome) = &self.final_outcome {
            dual_debug!("Memory already shut down");
            return Ok(outcome.clone());
        }

        let outcome = self.flush_buffer().await?;

        if self.config.enabled
            && let Err(e) = self.backend.close().await
        {
            dual_warn!("Failed to close memory backend: {}", e);
        }

        self.state = MemoryState::ShutDown;
        self.final_outcome = Some(outcome.clone());
        dual_info!("Memory system shut down");

        Ok(outcome)
    }

    /// Search stored memories of the configured user
    pub async fn search(&self, query: &str, limit: usize) -> MemoryResult<Vec<MemoryRecord>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        self.backend.search(&self.config.user_id, query, limit).await
    }

    async fn flush_buffer(&mut self) -> MemoryResult<FlushOutcome> {
        if !self.config.enabled {
            return Ok(FlushOutcome::Disabled);
        }
        if self.buffer.is_empty() {
            dual_debug!("No buffered turns to flush");
            return Ok(FlushOutcome::Empty);
        }

        let metadata = FlushMetadata {
            session_id: self.session_id.clone(),
            extracted_at: Utc::now(),
            message_count: self.buffer.len(),
            estimated_tokens: estimate_tokens(&self.buffer),
        };

        dual_info!(
            "Flushing {} turns (~{} tokens) from session {} started {}",
            metadata.message_count,
            metadata.estimated_tokens,
            metadata.session_id,
            self.session_started.to_rfc3339()
        );
        if metadata.estimated_tokens > self.config.max_tokens_per_flush {
            dual_warn!(
                "Session is ~{} tokens, above the {} token flush limit",
                metadata.estimated_tokens,
                self.config.max_tokens_per_flush
            );
        }

        // the turns stay buffered until the save succeeds, so a flush that is
        // cancelled mid-save loses nothing
        let result = {
            let _flushing = StateGuard::enter(&mut self.state, MemoryState::Flushing);
            save_with_rotation(
                &mut self.rotator,
                self.backend.as_ref(),
                &self.quota,
                &self.config.user_id,
                &self.buffer,
                &metadata,
            )
            .await
        };

        match result {
            Ok((receipt, attempts)) => {
                let credential_index = self.rotator.index();
                self.rotator.record_success();

                let turns = self.buffer.len();
                self.buffer.clear();
                self.discard_spooled(&metadata.session_id);

                self.session_id = new_session_id();
                self.session_started = Utc::now();
                self.state = MemoryState::Ready;

                dual_info!(
                    "Saved session {} with credential #{} after {} attempt(s): {} memories extracted",
                    metadata.session_id,
                    credential_index + 1,
                    attempts,
                    receipt.extracted
                );

                Ok(FlushOutcome::Saved {
                    turns,
                    extracted: receipt.extracted,
                    attempts,
                    credential_index,
                })
            }
            Err(failure) => {
                dual_error!("Memory flush failed: {}", failure);

                if matches!(
                    failure,
                    FlushFailure::Credentials(_) | FlushFailure::EmptyExtraction { .. }
                ) {
                    self.spool_session(&failure);
                }

                Err(MemoryError::FlushFailed(failure))
            }
        }
    }

    /// Save a session previously written to the fallback spool
    ///
    /// # Description
    /// Uses the same rotation rules as a regular flush but never touches the
    /// live session buffer and never spools again on failure. The caller owns
    /// the spool file and removes it once this returns `Saved`.
    pub async fn replay(&mut self, session: &SpooledSession) -> MemoryResult<FlushOutcome> {
        if !self.config.enabled {
            return Ok(FlushOutcome::Disabled);
        }
        if session.turns.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let metadata = FlushMetadata {
            session_id: session.session_id.clone(),
            extracted_at: Utc::now(),
            message_count: session.turns.len(),
            estimated_tokens: estimate_tokens(&session.turns),
        };

        let (receipt, attempts) = save_with_rotation(
            &mut self.rotator,
            self.backend.as_ref(),
            &self.quota,
            &self.config.user_id,
            &session.turns,
            &metadata,
        )
        .await?;
        let credential_index = self.rotator.index();
        self.rotator.record_success();

        dual_info!(
            "Replayed spooled session {}: {} memories extracted",
            session.session_id,
            receipt.extracted
        );

        Ok(FlushOutcome::Saved {
            turns: session.turns.len(),
            extracted: receipt.extracted,
            attempts,
            credential_index,
        })
    }

    /// A session saved after an earlier failure no longer needs its spool file.
    fn discard_spooled(&self, session_id: &str) {
        match self.spool.discard(session_id) {
            Ok(true) => dual_info!("Removed fallback file for saved session {}", session_id),
            Ok(false) => {}
            Err(e) => dual_warn!(
                "Failed to remove fallback file {}: {}",
                self.spool.path_for(session_id).display(),
                e
            ),
        }
    }

    fn spool_session(&self, failure: &FlushFailure) {
        let session = SpooledSession {
            session_id: self.session_id.clone(),
            user_id: self.config.user_id.clone(),
            saved_at: Utc::now(),
            reason: failure.to_string(),
            turns: self.buffer.clone(),
        };

        match self.spool.write(&session) {
            Ok(path) => dual_warn!("Session saved to fallback file {}", path.display()),
            Err(e) => dual_error!(
                "Failed to write fallback file in {}: {}",
                self.spool.dir().display(),
                e
            ),
        }
    }
}

/// Sets a state for the lifetime of the guard and restores the previous one on
/// drop, including when the owning future is cancelled.
struct StateGuard<'a> {
    state: &'a mut MemoryState,
    previous: MemoryState,
}

impl<'a> StateGuard<'a> {
    fn enter(state: &'a mut MemoryState, during: MemoryState) -> Self {
        let previous = std::mem::replace(state, during);
        Self { state, previous }
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.state = self.previous;
    }
}

/// Bounded retry loop: at most one attempt per credential.
///
/// Quota errors rotate to the next credential. An empty extraction from more
/// than [`EMPTY_EXTRACTION_TURNS`] turns is treated as a silent failure and
/// retried once with the next credential. Any other error ends the loop.
async fn save_with_rotation(
    rotator: &mut KeyRotator,
    backend: &dyn MemoryBackend,
    quota: &QuotaPolicy,
    user_id: &str,
    turns: &[Turn],
    metadata: &FlushMetadata,
) -> Result<(SaveReceipt, usize), FlushFailure> {
    let total = rotator.len();
    let mut attempt = 0;
    let mut empty_retried = false;

    loop {
        attempt += 1;
        let credential = rotator.current()?.clone();

        match backend.save(user_id, turns, metadata, &credential).await {
            Ok(receipt) if receipt.extracted == 0 && turns.len() > EMPTY_EXTRACTION_TURNS => {
                dual_warn!(
                    "No memories extracted from {} turns with credential #{} (attempt {}/{})",
                    turns.len(),
                    rotator.index() + 1,
                    attempt,
                    total
                );
                if empty_retried || attempt >= total {
                    return Err(FlushFailure::EmptyExtraction { turns: turns.len() });
                }
                empty_retried = true;
                rotator.rotate()?;
            }
            Ok(receipt) => return Ok((receipt, attempt)),
            Err(e) if quota.is_quota_error(e.status, &e.message) => {
                dual_warn!(
                    "Credential #{} hit its quota (attempt {}/{}): {}",
                    rotator.index() + 1,
                    attempt,
                    total,
                    e
                );
                if attempt >= total {
                    return Err(KeyError::AllCredentialsExhausted { total }.into());
                }
                rotator.rotate()?;
            }
            Err(e) => return Err(FlushFailure::Backend(e)),
        }
    }
}

fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Rough token estimate: one token per four characters.
fn estimate_tokens(turns: &[Turn]) -> usize {
    turns.iter().map(|t| t.content.chars().count()).sum::<usize>() / 4
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::keys::{Credential, FileIndexStore, MemoryIndexStore};

    /// Backend whose save results are scripted per call; records which
    /// credentials it was called with.
    #[derive(Default)]
    struct ScriptedBackend {
        saves: Mutex<Vec<Result<SaveReceipt, SaveError>>>,
        calls: Mutex<Vec<String>>,
        saved_turns: Mutex<Vec<usize>>,
        records: Vec<MemoryRecord>,
        fail_load: bool,
        closes: Mutex<usize>,
        /// Number of leading saves that hang long enough to be cancelled
        stalls: Mutex<usize>,
    }

    impl ScriptedBackend {
        fn with_saves(saves: Vec<Result<SaveReceipt, SaveError>>) -> Self {
            Self {
                saves: Mutex::new(saves),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn closes(&self) -> usize {
            *self.closes.lock().unwrap()
        }
    }

    #[async_trait]
    impl MemoryBackend for ScriptedBackend {
        async fn load(&self, _user_id: &str) -> MemoryResult<Vec<MemoryRecord>> {
            if self.fail_load {
                return Err(MemoryError::LoadFailed("store unreachable".into()));
            }
            Ok(self.records.clone())
        }

        async fn save(
            &self,
            _user_id: &str,
            turns: &[Turn],
            _metadata: &FlushMetadata,
            credential: &Credential,
        ) -> Result<SaveReceipt, SaveError> {
            self.calls.lock().unwrap().push(credential.expose().to_string());
            self.saved_turns.lock().unwrap().push(turns.len());

            let stall = {
                let mut stalls = self.stalls.lock().unwrap();
                let stall = *stalls > 0;
                *stalls = stalls.saturating_sub(1);
                stall
            };
            if stall {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }

            let mut saves = self.saves.lock().unwrap();
            if saves.is_empty() {
                Ok(SaveReceipt { extracted: 1 })
            } else {
                saves.remove(0)
            }
        }

        async fn search(
            &self,
            _user_id: &str,
            query: &str,
            limit: usize,
        ) -> MemoryResult<Vec<MemoryRecord>> {
            Ok(self
                .records
                .iter()
                .filter(|r| r.memory.contains(query))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn close(&self) -> MemoryResult<()> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn quota() -> Result<SaveReceipt, SaveError> {
        Err(SaveError::with_status(429, "RESOURCE_EXHAUSTED: quota exceeded"))
    }

    fn saved(extracted: usize) -> Result<SaveReceipt, SaveError> {
        Ok(SaveReceipt { extracted })
    }

    fn config(fallback: &std::path::Path) -> MemoryConfig {
        MemoryConfig {
            fallback_dir: fallback.to_path_buf(),
            ..MemoryConfig::default()
        }
    }

    fn rotator(keys: &[&str]) -> KeyRotator {
        KeyRotator::new(
            keys.iter().map(|k| k.to_string()).collect(),
            Box::new(MemoryIndexStore::default()),
        )
    }

    fn manager(
        backend: Arc<ScriptedBackend>,
        keys: &[&str],
        fallback: &std::path::Path,
    ) -> MemoryManager {
        MemoryManager::new(config(fallback), backend, rotator(keys), QuotaPolicy::default())
    }

    fn record(id: &str, kind: MemoryKind, text: &str, age_minutes: i64) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            user_id: "default_user".to_string(),
            memory: text.to_string(),
            metadata: MemoryMetadata {
                kind,
                session_id: None,
                created_at: Utc::now() - Duration::minutes(age_minutes),
                message_count: 0,
                estimated_tokens: 0,
            },
        }
    }

    async fn ready(manager: &mut MemoryManager) {
        manager.initialize().await;
        manager.record(MessageRole::User, "My sister's name is Maya");
        manager.record(MessageRole::Assistant, "I'll remember that.");
    }

    #[tokio::test]
    async fn test_initialize_skips_chat_records_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let mut records: Vec<_> = (0..12)
            .map(|i| record(&format!("m{i}"), MemoryKind::Memory, &format!("fact {i}"), 100 - i))
            .collect();
        records.push(record("c", MemoryKind::Chat, "raw dump", 1));

        let backend = Arc::new(ScriptedBackend {
            records,
            ..Default::default()
        });
        let mut manager = manager(backend, &["A"], dir.path());
        assert_eq!(manager.state(), MemoryState::Idle);

        manager.initialize().await;

        assert_eq!(manager.state(), MemoryState::Ready);
        let ids: Vec<_> = manager.loaded_memories().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 10);
        assert_eq!(ids.first(), Some(&"m2"));
        assert!(!ids.contains(&"c"));
    }

    #[tokio::test]
    async fn test_initialize_survives_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend {
            fail_load: true,
            ..Default::default()
        });
        let mut manager = manager(backend, &["A"], dir.path());

        manager.initialize().await;

        assert_eq!(manager.state(), MemoryState::Ready);
        assert_eq!(manager.loaded_context(), "");
    }

    #[tokio::test]
    async fn test_loaded_context_format() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend {
            records: vec![
                record("1", MemoryKind::Memory, "Likes tea", 2),
                record("2", MemoryKind::Memory, "Lives in Lyon", 1),
            ],
            ..Default::default()
        });
        let mut manager = manager(backend, &["A"], dir.path());
        manager.initialize().await;

        let context = manager.loaded_context();
        let lines: Vec<_> = context.lines().collect();
        assert_eq!(lines[0], "**Past Memories:**");
        assert!(lines[1].starts_with("1. ["));
        assert!(lines[1].ends_with("] Likes tea"));
        assert!(lines[2].ends_with("] Lives in Lyon"));
    }

    #[tokio::test]
    async fn test_record_buffers_only_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(Arc::new(ScriptedBackend::default()), &["A"], dir.path());
        manager.initialize().await;

        manager.record(MessageRole::System, "You are Astro");
        manager.record(MessageRole::Tool, "Paris: +18°C");
        manager.record(MessageRole::User, "   ");
        assert_eq!(manager.state(), MemoryState::Ready);
        assert!(manager.buffered().is_empty());

        manager.record(MessageRole::User, "hello");
        assert_eq!(manager.state(), MemoryState::Buffering);
        assert_eq!(manager.buffered().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_flush_does_not_call_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let mut manager = manager(backend.clone(), &["A"], dir.path());
        manager.initialize().await;

        assert_eq!(manager.flush().await.unwrap(), FlushOutcome::Empty);
        assert_eq!(manager.shutdown().await.unwrap(), FlushOutcome::Empty);
        assert!(backend.calls().is_empty());
        assert_eq!(manager.state(), MemoryState::ShutDown);
    }

    #[tokio::test]
    async fn test_successful_flush_clears_buffer_and_starts_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![saved(2)]));
        let mut manager = manager(backend.clone(), &["A", "B"], dir.path());
        ready(&mut manager).await;
        let first_session = manager.session_id().to_string();

        let outcome = manager.flush().await.unwrap();

        assert_eq!(
            outcome,
            FlushOutcome::Saved {
                turns: 2,
                extracted: 2,
                attempts: 1,
                credential_index: 0
            }
        );
        assert!(manager.buffered().is_empty());
        assert_eq!(manager.state(), MemoryState::Ready);
        assert_ne!(manager.session_id(), first_session);
        assert_eq!(backend.calls(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_quota_error_rotates_to_next_credential() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![quota(), saved(1)]));
        let mut manager = manager(backend.clone(), &["A", "B"], dir.path());
        ready(&mut manager).await;

        let outcome = manager.shutdown().await.unwrap();

        assert_eq!(backend.calls(), vec!["A", "B"]);
        assert_eq!(
            outcome,
            FlushOutcome::Saved {
                turns: 2,
                extracted: 1,
                attempts: 2,
                credential_index: 1
            }
        );
        assert_eq!(manager.rotator().index(), 1);
        assert_eq!(manager.state(), MemoryState::ShutDown);
        assert_eq!(backend.closes(), 1);
    }

    #[tokio::test]
    async fn test_rotated_index_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let index_file = dir.path().join("memory_key_index.txt");
        let keys = vec!["A".to_string(), "B".to_string()];
        let backend = Arc::new(ScriptedBackend::with_saves(vec![quota(), saved(1)]));
        let mut manager = MemoryManager::new(
            config(dir.path()),
            backend.clone(),
            KeyRotator::new(keys.clone(), Box::new(FileIndexStore::new(&index_file))),
            QuotaPolicy::default(),
        );
        manager.initialize().await;
        manager.record(MessageRole::User, "hello");

        let outcome = manager.flush().await.unwrap();

        assert!(matches!(outcome, FlushOutcome::Saved { credential_index: 1, .. }));
        assert!(manager.buffered().is_empty());
        assert_eq!(backend.calls(), vec!["A", "B"]);
        assert_eq!(std::fs::read_to_string(&index_file).unwrap().trim(), "1");

        let restarted = KeyRotator::new(keys, Box::new(FileIndexStore::new(&index_file)));
        assert_eq!(restarted.index(), 1);
        assert_eq!(restarted.current().unwrap().expose(), "B");
    }

    #[tokio::test]
    async fn test_cancelled_flush_keeps_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend {
            stalls: Mutex::new(1),
            ..Default::default()
        });
        let mut manager = manager(backend.clone(), &["A"], dir.path());
        ready(&mut manager).await;

        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(50), manager.flush()).await;

        assert!(cancelled.is_err());
        assert_eq!(manager.buffered().len(), 2);
        assert_eq!(manager.state(), MemoryState::Buffering);

        // the same turns go out on the next attempt
        let outcome = manager.flush().await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Saved { turns: 2, .. }));
        assert_eq!(*backend.saved_turns.lock().unwrap(), vec![2, 2]);
        assert!(manager.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_successful_retry_removes_fallback_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![quota(), saved(2)]));
        let mut manager = manager(backend.clone(), &["A"], dir.path());
        ready(&mut manager).await;
        let spool = FallbackSpool::new(dir.path());

        assert!(manager.flush().await.is_err());
        assert_eq!(spool.pending().unwrap().len(), 1);

        assert!(manager.flush().await.is_ok());
        assert!(manager.buffered().is_empty());
        assert!(spool.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_extraction_is_retried_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![saved(0), saved(0)]));
        let mut manager = manager(backend.clone(), &["A", "B", "C"], dir.path());
        ready(&mut manager).await;
        manager.record(MessageRole::User, "Also, I moved to Lyon");

        let err = manager.flush().await.unwrap_err();

        assert!(matches!(
            err,
            MemoryError::FlushFailed(FlushFailure::EmptyExtraction { turns: 3 })
        ));
        // one retry only, not one per credential
        assert_eq!(backend.calls(), vec!["A", "B"]);
        assert_eq!(manager.buffered().len(), 3);
        assert_eq!(FallbackSpool::new(dir.path()).pending().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_extraction_recovers_on_next_credential() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![saved(0), saved(2)]));
        let mut manager = manager(backend.clone(), &["A", "B"], dir.path());
        ready(&mut manager).await;
        manager.record(MessageRole::User, "Also, I moved to Lyon");

        let outcome = manager.flush().await.unwrap();

        assert_eq!(
            outcome,
            FlushOutcome::Saved {
                turns: 3,
                extracted: 2,
                attempts: 2,
                credential_index: 1
            }
        );
    }

    #[tokio::test]
    async fn test_empty_extraction_of_short_chat_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![saved(0)]));
        let mut manager = manager(backend.clone(), &["A", "B"], dir.path());
        ready(&mut manager).await;

        let outcome = manager.flush().await.unwrap();

        assert!(matches!(outcome, FlushOutcome::Saved { extracted: 0, attempts: 1, .. }));
        assert!(manager.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_all_credentials_exhausted_keeps_buffer_and_spools() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![quota(), quota(), quota()]));
        let mut manager = manager(backend.clone(), &["A", "B"], dir.path());
        ready(&mut manager).await;
        let session_id = manager.session_id().to_string();

        let err = manager.shutdown().await.unwrap_err();

        assert!(matches!(
            err,
            MemoryError::FlushFailed(FlushFailure::Credentials(
                KeyError::AllCredentialsExhausted { total: 2 }
            ))
        ));
        // one attempt per credential, no third call
        assert_eq!(backend.calls(), vec!["A", "B"]);
        assert_eq!(manager.buffered().len(), 2);
        assert_eq!(manager.state(), MemoryState::Buffering);
        assert_eq!(backend.closes(), 0);

        let spooled = FallbackSpool::new(dir.path()).pending().unwrap();
        assert_eq!(spooled.len(), 1);
        let session = FallbackSpool::read(&spooled[0]).unwrap();
        assert_eq!(session.session_id, session_id);
        assert_eq!(session.turns.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_can_be_retried_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![quota(), saved(3)]));
        let mut manager = manager(backend.clone(), &["A"], dir.path());
        ready(&mut manager).await;

        assert!(manager.shutdown().await.is_err());
        assert_ne!(manager.state(), MemoryState::ShutDown);

        // a successful save starts a new rotation pass
        let outcome = manager.shutdown().await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Saved { extracted: 3, .. }));
        assert_eq!(backend.calls(), vec!["A", "A"]);
    }

    #[tokio::test]
    async fn test_non_quota_error_fails_without_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![Err(
            SaveError::with_status(500, "internal error"),
        )]));
        let mut manager = manager(backend.clone(), &["A", "B"], dir.path());
        ready(&mut manager).await;

        let err = manager.flush().await.unwrap_err();

        assert!(matches!(
            err,
            MemoryError::FlushFailed(FlushFailure::Backend(SaveError {
                status: Some(500),
                ..
            }))
        ));
        assert_eq!(backend.calls(), vec!["A"]);
        assert_eq!(manager.rotator().index(), 0);
        assert_eq!(manager.buffered().len(), 2);
        assert!(FallbackSpool::new(dir.path()).pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_shutdown_returns_prior_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![saved(1)]));
        let mut manager = manager(backend.clone(), &["A"], dir.path());
        ready(&mut manager).await;

        let first = manager.shutdown().await.unwrap();
        let second = manager.shutdown().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.calls().len(), 1);
        assert_eq!(backend.closes(), 1);

        // turns after shutdown are ignored
        manager.record(MessageRole::User, "still there?");
        assert!(manager.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_memory_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend {
            records: vec![record("1", MemoryKind::Memory, "Likes tea", 1)],
            ..Default::default()
        });
        let config = MemoryConfig {
            enabled: false,
            ..config(dir.path())
        };
        let mut manager =
            MemoryManager::new(config, backend.clone(), rotator(&[]), QuotaPolicy::default());

        manager.initialize().await;
        manager.record(MessageRole::User, "hello");

        assert!(manager.loaded_memories().is_empty());
        assert!(manager.buffered().is_empty());
        assert_eq!(manager.flush().await.unwrap(), FlushOutcome::Disabled);
        assert_eq!(manager.shutdown().await.unwrap(), FlushOutcome::Disabled);
        assert!(manager.search("tea", 5).await.unwrap().is_empty());
        assert!(backend.calls().is_empty());
        assert_eq!(backend.closes(), 0);
    }

    #[tokio::test]
    async fn test_no_credentials_fails_flush() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let mut manager = manager(backend.clone(), &[], dir.path());
        ready(&mut manager).await;

        let err = manager.flush().await.unwrap_err();

        assert!(matches!(
            err,
            MemoryError::FlushFailed(FlushFailure::Credentials(KeyError::NoCredentialsAvailable))
        ));
        assert!(backend.calls().is_empty());
        assert_eq!(manager.buffered().len(), 2);
    }

    #[tokio::test]
    async fn test_replay_spooled_session() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::with_saves(vec![quota(), saved(4)]));
        let mut manager = manager(backend.clone(), &["A", "B"], dir.path());
        manager.initialize().await;
        manager.record(MessageRole::User, "live turn");

        let session = SpooledSession {
            session_id: "old".to_string(),
            user_id: "default_user".to_string(),
            saved_at: Utc::now(),
            reason: "exhausted".to_string(),
            turns: vec![
                Turn::new(MessageRole::User, "a"),
                Turn::new(MessageRole::Assistant, "b"),
                Turn::new(MessageRole::User, "c"),
            ],
        };

        let outcome = manager.replay(&session).await.unwrap();

        assert_eq!(
            outcome,
            FlushOutcome::Saved {
                turns: 3,
                extracted: 4,
                attempts: 2,
                credential_index: 1
            }
        );
        assert_eq!(*backend.saved_turns.lock().unwrap(), vec![3, 3]);
        assert_eq!(manager.buffered().len(), 1);
    }

    #[tokio::test]
    async fn test_search_delegates_to_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend {
            records: vec![
                record("1", MemoryKind::Memory, "Likes tea", 2),
                record("2", MemoryKind::Memory, "Lives in Lyon", 1),
            ],
            ..Default::default()
        });
        let manager = manager(backend, &["A"], dir.path());

        let hits = manager.search("Lyon", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "2");
    }

    #[test]
    fn test_estimate_tokens() {
        let turns = vec![
            Turn::new(MessageRole::User, "a".repeat(10)),
            Turn::new(MessageRole::Assistant, "b".repeat(30)),
        ];
        assert_eq!(estimate_tokens(&turns), 10);
    }
}

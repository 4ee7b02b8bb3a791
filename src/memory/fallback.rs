use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::types::Turn;

/// Raw session dump written when a flush could not reach the backend with
/// any credential, so the conversation survives until someone replays it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpooledSession {
    pub session_id: String,
    pub user_id: String,
    pub saved_at: DateTime<Utc>,
    pub reason: String,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone)]
pub struct FallbackSpool {
    dir: PathBuf,
}

impl FallbackSpool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("session_{session_id}.json"))
    }

    /// Write `session_<id>.json`, replacing any earlier dump of the same session.
    pub fn write(&self, session: &SpooledSession) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&session.session_id);

        let json = serde_json::to_string_pretty(session).map_err(io::Error::other)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(path)
    }

    /// Spooled sessions waiting to be replayed, sorted by file name.
    pub fn pending(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_session = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("session_") && n.ends_with(".json"));
            if is_session {
                files.push(path);
            }
        }
        files.sort();

        Ok(files)
    }

    /// Remove the dump of `session_id`. Returns `false` when there was none.
    pub fn discard(&self, session_id: &str) -> io::Result<bool> {
        match fs::remove_file(self.path_for(session_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn read(path: impl AsRef<Path>) -> io::Result<SpooledSession> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MessageRole;

    fn session(id: &str) -> SpooledSession {
        SpooledSession {
            session_id: id.to_string(),
            user_id: "ada".to_string(),
            saved_at: Utc::now(),
            reason: "All 2 API credentials have been exhausted".to_string(),
            turns: vec![
                Turn::new(MessageRole::User, "remember my locker code is 4412"),
                Turn::new(MessageRole::Assistant, "Noted."),
            ],
        }
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FallbackSpool::new(dir.path().join("fallback"));

        let path = spool.write(&session("abc")).unwrap();
        assert_eq!(path.file_name().unwrap(), "session_abc.json");

        let restored = FallbackSpool::read(&path).unwrap();
        assert_eq!(restored.turns.len(), 2);
        assert_eq!(restored.user_id, "ada");
    }

    #[test]
    fn test_pending_lists_only_session_files() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FallbackSpool::new(dir.path());
        assert!(spool.pending().unwrap().is_empty());

        spool.write(&session("b")).unwrap();
        spool.write(&session("a")).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let names: Vec<_> = spool
            .pending()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["session_a.json", "session_b.json"]);
    }

    #[test]
    fn test_missing_dir_has_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FallbackSpool::new(dir.path().join("never-created"));
        assert!(spool.pending().unwrap().is_empty());
    }

    #[test]
    fn test_discard_removes_only_that_session() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FallbackSpool::new(dir.path());
        spool.write(&session("a")).unwrap();
        spool.write(&session("b")).unwrap();

        assert!(spool.discard("a").unwrap());
        assert!(!spool.discard("a").unwrap());
        assert_eq!(spool.pending().unwrap(), vec![spool.path_for("b")]);
    }
}

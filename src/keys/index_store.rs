use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Durable storage for the credential rotation index.
pub trait IndexStore: Send + Sync {
    /// Returns `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> io::Result<Option<usize>>;

    fn save(&self, index: usize) -> io::Result<()>;

    /// Human readable location, used in status reports.
    fn location(&self) -> String;
}

/// Stores the index as a decimal integer in a single text file.
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the target, so a crash mid-write leaves either the old or the new value.
#[derive(Debug, Clone)]
pub struct FileIndexStore {
    path: PathBuf,
}

impl FileIndexStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

impl IndexStore for FileIndexStore {
    fn load(&self) -> io::Result<Option<usize>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        content
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid index '{}': {e}", content.trim()),
                )
            })
    }

    fn save(&self, index: usize) -> io::Result<()> {
        let dir = self.parent_dir();
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        write!(tmp, "{index}")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Process-local index storage, used when persistence is not wanted.
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    value: Mutex<Option<usize>>,
}

impl MemoryIndexStore {
    pub fn new(initial: Option<usize>) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }
}

impl IndexStore for MemoryIndexStore {
    fn load(&self) -> io::Result<Option<usize>> {
        Ok(*self.value.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn save(&self, index: usize) -> io::Result<()> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(index);
        Ok(())
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIndexStore::new(dir.path().join("index.txt"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIndexStore::new(dir.path().join("index.txt"));

        store.save(3).unwrap();
        assert_eq!(store.load().unwrap(), Some(3));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "3");

        store.save(0).unwrap();
        assert_eq!(store.load().unwrap(), Some(0));
    }

    #[test]
    fn test_save_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIndexStore::new(dir.path().join("nested").join("index.txt"));

        store.save(1).unwrap();
        assert_eq!(store.load().unwrap(), Some(1));
    }

    #[test]
    fn test_garbage_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.txt");
        fs::write(&path, "not-a-number").unwrap();

        let err = FileIndexStore::new(&path).load().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_whitespace_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.txt");
        fs::write(&path, " 2\n").unwrap();

        assert_eq!(FileIndexStore::new(&path).load().unwrap(), Some(2));
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIndexStore::new(dir.path().join("index.txt"));
        store.save(1).unwrap();
        store.save(2).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}

//! Durable backends for the message log.
//!
//! Every backend stores a complete snapshot of the log. A save either
//! replaces the previous snapshot entirely or leaves it untouched.

use crate::store::StoreError;
use huddle_protocol::Message;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Snapshot storage for the message log.
pub trait Persistence: Send {
    /// Read the last saved snapshot.
    ///
    /// Returns `Ok(None)` if nothing has been saved yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a snapshot exists but cannot be read or parsed.
    fn load(&mut self) -> Result<Option<Vec<Message>>, StoreError>;

    /// Replace the saved snapshot with `messages`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot could not be made durable. The
    /// previous snapshot is left intact in that case.
    fn save(&mut self, messages: &[Message]) -> Result<(), StoreError>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

/// Snapshot stored as a pretty-printed JSON array in a single file.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    /// Create a backend for the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the snapshot; `.` for a bare file name.
    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }

    fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            location: self.location(),
            reason: reason.into(),
        }
    }
}

impl Persistence for JsonFile {
    fn load(&mut self) -> Result<Option<Vec<Message>>, StoreError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.corrupt(format!("unreadable: {e}"))),
        };

        if contents.iter().all(u8::is_ascii_whitespace) {
            return Err(self.corrupt("file is empty"));
        }

        let messages: Vec<Message> =
            serde_json::from_slice(&contents).map_err(|e| self.corrupt(e.to_string()))?;

        let mut ids = HashSet::with_capacity(messages.len());
        if let Some(dup) = messages.iter().find(|m| !ids.insert(&m.id)) {
            return Err(self.corrupt(format!("duplicate message id {}", dup.id)));
        }

        Ok(Some(messages))
    }

    fn save(&mut self, messages: &[Message]) -> Result<(), StoreError> {
        fs::create_dir_all(self.dir())?;

        let json = serde_json::to_vec_pretty(messages).map_err(io::Error::from)?;
        let temp_path = self.temp_path();

        // Write to temp file
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        // Atomic rename, then persist the directory entry itself
        fs::rename(&temp_path, &self.path)?;
        sync_dir(self.dir())?;

        debug!(path = %self.path.display(), messages = messages.len(), "Snapshot saved");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Flush a directory so a rename inside it survives a crash.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Directories cannot be opened for syncing here; rename durability is left
/// to the filesystem.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// In-memory snapshot storage.
///
/// Clones share the same snapshot, so a clone kept aside can stand in for
/// the durable state across a simulated restart. Writes can be made to fail
/// on demand.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    snapshot: Arc<Mutex<Option<Vec<Message>>>>,
    failing: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that already holds `messages`.
    #[must_use]
    pub fn with_messages(messages: Vec<Message>) -> Self {
        let backend = Self::default();
        *backend.lock() = Some(messages);
        backend
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The currently saved snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Option<Vec<Message>> {
        self.lock().clone()
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<Message>>> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Persistence for MemoryBackend {
    fn load(&mut self) -> Result<Option<Vec<Message>>, StoreError> {
        Ok(self.lock().clone())
    }

    fn save(&mut self, messages: &[Message]) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Persistence(io::Error::new(
                io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        *self.lock() = Some(messages.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(id: &str, author: &str) -> Message {
        Message::new(id.into(), author, "hello", Utc::now())
    }

    #[test]
    fn test_json_file_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = JsonFile::new(dir.path().join("data.json"));
        assert!(backend.load().unwrap().is_none());
    }

    #[test]
    fn test_json_file_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");
        let mut backend = JsonFile::new(&path);

        let messages = vec![message("a", "Alice"), message("b", "Bob")];
        backend.save(&messages).unwrap();

        assert!(path.exists());
        assert!(!backend.temp_path().exists());
        assert_eq!(backend.load().unwrap(), Some(messages));
    }

    #[test]
    fn test_json_file_directory() {
        assert_eq!(JsonFile::new("data.json").dir(), Path::new("."));
        assert_eq!(
            JsonFile::new("/var/lib/huddle/data.json").dir(),
            Path::new("/var/lib/huddle")
        );
    }

    #[test]
    fn test_sync_dir() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).unwrap();
        sync_dir(Path::new(".")).unwrap();

        #[cfg(unix)]
        assert!(sync_dir(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_json_file_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        fs::write(&path, "[{\"id\": ").unwrap();
        assert!(matches!(
            JsonFile::new(&path).load(),
            Err(StoreError::Corrupt { .. })
        ));

        fs::write(&path, "").unwrap();
        assert!(matches!(
            JsonFile::new(&path).load(),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_json_file_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let json = serde_json::to_string(&vec![message("a", "Alice"), message("a", "Bob")]).unwrap();
        fs::write(&path, json).unwrap();

        assert!(matches!(
            JsonFile::new(&path).load(),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_json_file_reads_legacy_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(
            &path,
            r#"[
  {
    "id": "1700000000000_k3j9x1",
    "user": "Alice",
    "text": "hello",
    "timestamp": "2023-11-14T22:13:20.000Z"
  }
]"#,
        )
        .unwrap();

        let messages = JsonFile::new(&path).load().unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].author, "Alice");
    }

    #[test]
    fn test_memory_backend_failure() {
        let mut backend = MemoryBackend::new();
        backend.save(&[message("a", "Alice")]).unwrap();

        backend.set_failing(true);
        assert!(backend.save(&[]).is_err());
        assert_eq!(backend.snapshot().map(|m| m.len()), Some(1));
        assert_eq!(backend.save_count(), 1);
    }
}

//! Key/value storage shared by every client instance of the same origin,
//! with change notifications.
//!
//! Delivery is at-least-once and unordered across keys. Writers see their own
//! changes too; callers filter by content.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::broadcast;

const CHANGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// `None` when the key was removed.
    pub value: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("file watcher error: {0}")]
    Watch(String),
    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
}

#[async_trait]
pub trait SharedStorage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

fn check_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Storage shared by instances living in one process.
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            values: Mutex::new(HashMap::new()),
            changes,
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStorage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        check_key(key)?;
        Ok(self.values.lock().get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        check_key(key)?;
        self.values.lock().insert(key.to_string(), value.to_string());
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        check_key(key)?;
        if self.values.lock().remove(key).is_some() {
            let _ = self.changes.send(StorageChange {
                key: key.to_string(),
                value: None,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Directory-backed
// ---------------------------------------------------------------------------

/// One file per key in a directory that several processes may open.
///
/// Writes go to a dot-prefixed temporary file and are renamed into place, so
/// readers never observe a partial value. Changes made by any process are
/// picked up by a filesystem watcher on the directory.
pub struct FileStorage {
    dir: PathBuf,
    changes: broadcast::Sender<StorageChange>,
    tmp_seq: AtomicU64,
    _watcher: RecommendedWatcher,
}

impl FileStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

        let mut watcher = {
            let changes = changes.clone();
            let dir = dir.clone();
            RecommendedWatcher::new(
                move |result: Result<Event, notify::Error>| match result {
                    Ok(event) => publish(&dir, &changes, event),
                    Err(e) => tracing::error!("storage watcher error: {e}"),
                },
                notify::Config::default(),
            )
            .map_err(|e| StorageError::Watch(format!("failed to create watcher: {e}")))?
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| StorageError::Watch(format!("failed to watch {}: {e}", dir.display())))?;

        tracing::debug!(dir = %dir.display(), "file storage opened");
        Ok(Self {
            dir,
            changes,
            tmp_seq: AtomicU64::new(0),
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        check_key(key)?;
        Ok(self.dir.join(key))
    }
}

/// Translate a watcher event into changes for the keys it touched.
fn publish(dir: &Path, changes: &broadcast::Sender<StorageChange>, event: Event) {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return;
    }
    for path in &event.paths {
        let Some(key) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if check_key(key).is_err() {
            continue;
        }
        let value = match std::fs::read_to_string(dir.join(key)) {
            Ok(value) => Some(value),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(key, "failed to read changed key: {e}");
                continue;
            }
        };
        let _ = changes.send(StorageChange {
            key: key.to_string(),
            value,
        });
    }
}

#[async_trait]
impl SharedStorage for FileStorage {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.path(key)?).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path(key)?;
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!(".{key}.{}.{seq}.tmp", std::process::id()));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

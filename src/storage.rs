//! # Durable Key-Value Storage
//!
//! Client-side persistence seam used by the offline queue to survive
//! process restarts. Implementations must tolerate being called on every
//! queue mutation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::debug;

use crate::error::{Result, SyncError};

/// Synchronous key-value persistence primitive.
pub trait KeyValueStore: Send + Sync {
    /// Implementation name, for logs
    fn name(&self) -> &str;

    /// Read a value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value durably
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value, returning whether it existed
    fn remove(&self, key: &str) -> Result<bool>;
}

/// In-memory store for tests and ephemeral sessions.
pub struct MemoryStore {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self
            .data
            .read()
            .map_err(|_| SyncError::storage("store lock poisoned"))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| SyncError::storage("store lock poisoned"))?;
        data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut data = self
            .data
            .write()
            .map_err(|_| SyncError::storage("store lock poisoned"))?;
        Ok(data.remove(key).is_some())
    }
}

/// JSON-file-backed store.
///
/// The whole map is rewritten on every `set`, which is acceptable at
/// offline-queue sizes.
pub struct FileStore {
    path: PathBuf,
    data: RwLock<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store, loading existing contents if the file is present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| SyncError::storage(format!("failed to read store file: {}", e)))?;
            serde_json::from_str(&raw)
                .map_err(|e| SyncError::storage(format!("failed to parse store file: {}", e)))?
        } else {
            HashMap::new()
        };

        debug!(
            target: "storage",
            path = %path.display(),
            "File store opened"
        );

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    fn flush(&self, data: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::storage(format!("failed to create store directory: {}", e)))?;
        }
        let json = serde_json::to_string_pretty(data)?;
        std::fs::write(&self.path, json)
            .map_err(|e| SyncError::storage(format!("failed to write store file: {}", e)))
    }
}

impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self
            .data
            .read()
            .map_err(|_| SyncError::storage("store lock poisoned"))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| SyncError::storage("store lock poisoned"))?;
        data.insert(key.to_string(), value.to_string());
        self.flush(&data)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut data = self
            .data
            .write()
            .map_err(|_| SyncError::storage("store lock poisoned"))?;
        let existed = data.remove(key).is_some();
        if existed {
            self.flush(&data)?;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").unwrap(), None);

        store.set("queue", "[]").unwrap();
        assert_eq!(store.get("queue").unwrap().as_deref(), Some("[]"));

        assert!(store.remove("queue").unwrap());
        assert!(!store.remove("queue").unwrap());
        assert_eq!(store.get("queue").unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync-store.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set("sync.last_drain_at", "\"2024-05-01T10:00:00Z\"").unwrap();
            store.set("sync.pending_ops", "[]").unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("sync.last_drain_at").unwrap().as_deref(),
            Some("\"2024-05-01T10:00:00Z\"")
        );
        assert_eq!(reopened.get("sync.pending_ops").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_file_store_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync-store.json");

        let store = FileStore::open(&path).unwrap();
        store.set("a", "1").unwrap();
        assert!(store.remove("a").unwrap());

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("a").unwrap(), None);
    }
}

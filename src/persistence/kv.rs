//! Platform key-value storage contract.
//!
//! The persistence layer only needs four operations over string keys and
//! string values. Implementations:
//!
//! - **Memory**: [`MemoryStore`], process-local, for tests and ephemeral state
//! - **File**: [`FileStore`], one file per key under a directory
//!
//! ## Crash Safety
//!
//! `FileStore::set` writes to a temporary file, fsyncs it and renames it over
//! the target. An interrupted write leaves either the previous value or the
//! new one, never a torn file under the real key.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// File extension for committed values
const VALUE_EXT: &str = "val";

/// Errors that can occur during key-value operations
#[derive(Debug, Error)]
pub enum KvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Minimal async key-value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the raw value stored under `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), KvError>;

    /// List every stored key (order unspecified).
    async fn list_keys(&self) -> Result<Vec<String>, KvError>;
}

/// In-memory store backed by a `HashMap`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, KvError> {
        Ok(self.lock().keys().cloned().collect())
    }
}

/// Directory-backed store, one file per key.
///
/// Filenames are the hex encoding of the key, so any key string is safe on
/// every filesystem.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, KvError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", hex::encode(key.as_bytes()), VALUE_EXT))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        let suffix: u64 = rand::random();
        self.root
            .join(format!("{}.tmp-{:016x}", hex::encode(key.as_bytes()), suffix))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        match tokio::fs::read(self.value_path(key)).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KvError::Io(e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let tmp_path = self.temp_path(key);
        let final_path = self.value_path(key);

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let written = async {
            file.write_all(value.as_bytes()).await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(KvError::Io(e));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(KvError::Io(e));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        match tokio::fs::remove_file(self.value_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KvError::Io(e)),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, KvError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();

            // Leftover temp files from interrupted writes are not keys
            if let Some(stem) = name.strip_suffix(&format!(".{}", VALUE_EXT)) {
                if let Ok(bytes) = hex::decode(stem) {
                    if let Ok(key) = String::from_utf8(bytes) {
                        keys.push(key);
                    }
                }
            }
        }

        Ok(keys)
    }
}

//! Durable single-node backend.
//!
//! The whole keyspace lives in memory and is written to one JSON file after
//! every mutation (write to a temp file, then rename over the old one), so a
//! crash never leaves a half-written snapshot behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::memory::Keyspace;
use super::{Backend, StoreError};

/// File-backed keyspace.
#[derive(Debug)]
pub struct FileBackend {
    name: String,
    path: PathBuf,
    data: Mutex<Keyspace>,
}

impl FileBackend {
    /// Open (or create) the keyspace file at `path`.
    pub async fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let data = match fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => Keyspace::default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Keyspace::default(),
            Err(e) => return Err(e.into()),
        };
        info!(backend = %name, path = %path.display(), "Opened file backend");

        Ok(Self {
            name,
            path,
            data: Mutex::new(data),
        })
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, data: &Keyspace) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(data)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(backend = %self.name, bytes = bytes.len(), "Flushed keyspace");
        Ok(())
    }

    /// Apply a mutation and persist it. The in-memory copy only changes when
    /// the flush succeeds.
    async fn mutate<T>(&self, f: impl FnOnce(&mut Keyspace) -> T) -> Result<T, StoreError> {
        let mut guard = self.data.lock().await;
        let mut next = guard.clone();
        let result = f(&mut next);
        self.flush(&next).await?;
        *guard = next;
        Ok(result)
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match fs::metadata(&self.path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let data = self.data.lock().await;
                self.flush(&data).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.lock().await.get(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.mutate(|data| data.set(key, value)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.mutate(|data| data.delete(key)).await
    }

    async fn push_back(&self, key: &str, value: String) -> Result<usize, StoreError> {
        self.mutate(|data| data.push_back(key, value)).await
    }

    async fn push_front(&self, key: &str, value: String) -> Result<usize, StoreError> {
        self.mutate(|data| data.push_front(key, value)).await
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        {
            let data = self.data.lock().await;
            if data.list_len(key) == 0 {
                return Ok(None);
            }
        }
        self.mutate(|data| data.pop_front(key)).await
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.data.lock().await.list(key))
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.data.lock().await.list_len(key))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.data.lock().await.keys(prefix))
    }
}

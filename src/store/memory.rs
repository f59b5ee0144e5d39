//! In-process backend.
//!
//! Also provides [`Keyspace`], the plain data structure both the memory and
//! file backends store their data in.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{Backend, StoreError};

/// Values and lists, keyed by string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyspace {
    values: BTreeMap<String, String>,
    lists: BTreeMap<String, VecDeque<String>>,
}

impl Keyspace {
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let value = self.values.remove(key).is_some();
        let list = self.lists.remove(key).is_some();
        value || list
    }

    pub fn push_back(&mut self, key: &str, value: String) -> usize {
        let list = self.lists.entry(key.to_string()).or_default();
        list.push_back(value);
        list.len()
    }

    pub fn push_front(&mut self, key: &str, value: String) -> usize {
        let list = self.lists.entry(key.to_string()).or_default();
        list.push_front(value);
        list.len()
    }

    /// Empty lists disappear, like Redis.
    pub fn pop_front(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_front();
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.lists.get(key).map(|l| l.len()).unwrap_or(0)
    }

    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .keys()
            .chain(self.lists.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Keyspace held in memory, with fault injection for tests.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    data: RwLock<Keyspace>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    failing_writes: Mutex<BTreeSet<String>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(Keyspace::default()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            failing_writes: Mutex::new(BTreeSet::new()),
        }
    }

    /// Make every operation fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every operation.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make writes to one key fail while everything else keeps working.
    pub fn fail_writes_to(&self, key: &str) {
        if let Ok(mut keys) = self.failing_writes.lock() {
            keys.insert(key.to_string());
        }
    }

    /// Undo every [`MemoryBackend::fail_writes_to`].
    pub fn clear_failures(&self) {
        if let Ok(mut keys) = self.failing_writes.lock() {
            keys.clear();
        }
    }

    async fn check_write(&self, key: &str) -> Result<(), StoreError> {
        self.check().await?;
        let failing = self
            .failing_writes
            .lock()
            .map(|keys| keys.contains(key))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Unavailable {
                backend: self.name.clone(),
                reason: format!("write to {} refused", key),
            });
        }
        Ok(())
    }

    async fn check(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                backend: self.name.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check().await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check().await?;
        Ok(self.data.read().await.get(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.check_write(key).await?;
        self.data.write().await.set(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check().await?;
        Ok(self.data.write().await.delete(key))
    }

    async fn push_back(&self, key: &str, value: String) -> Result<usize, StoreError> {
        self.check_write(key).await?;
        Ok(self.data.write().await.push_back(key, value))
    }

    async fn push_front(&self, key: &str, value: String) -> Result<usize, StoreError> {
        self.check_write(key).await?;
        Ok(self.data.write().await.push_front(key, value))
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check().await?;
        Ok(self.data.write().await.pop_front(key))
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check().await?;
        Ok(self.data.read().await.list(key))
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.check().await?;
        Ok(self.data.read().await.list_len(key))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check().await?;
        Ok(self.data.read().await.keys(prefix))
    }
}

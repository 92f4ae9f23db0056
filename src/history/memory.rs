use async_trait::async_trait;
use chrono::{ DateTime, Duration, Utc };
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use crate::history::{ BackendError, Clock, DurableStore, EphemeralStore };

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process backend serving both storage roles. Expired entries are only
/// purged when read, so stale keys linger until something touches them.
pub struct MemoryHistoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryHistoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored keys, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn read(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let expired = match entries.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| at <= now),
            None => return None,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    async fn write(&self, key: &str, value: &str, expires_at: Option<DateTime<Utc>>) {
        self.entries.write().await.insert(key.to_string(), Entry {
            value: value.to_string(),
            expires_at,
        });
    }

    async fn remove(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }
}

#[async_trait]
impl DurableStore for MemoryHistoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.read(key).await)
    }

    async fn set(&self, key: &str, value: &str) -> Result<bool, BackendError> {
        self.write(key, value, None).await;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.remove(key).await)
    }
}

#[async_trait]
impl EphemeralStore for MemoryHistoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.read(key).await)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool, BackendError> {
        let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
        let expires_at = Duration::try_seconds(ttl).and_then(|d| self.clock.now().checked_add_signed(d));
        self.write(key, value, expires_at).await;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.remove(key).await)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let entries = self.entries.read().await;
        Ok(
            entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        )
    }
}

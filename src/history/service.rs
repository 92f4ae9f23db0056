use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use log::{ debug, error, info, warn };
use serde::{ Serialize, Deserialize };
use std::collections::HashMap;
use std::sync::{ Arc, Mutex as StdMutex };
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cli::ExpiryPolicy;
use crate::history::{
    BackendError,
    Clock,
    DurableStore,
    EphemeralStore,
    ExportFormat,
    HistoryConfig,
    HistoryError,
    Identity,
    TIMESTAMP_FORMAT,
};
use crate::models::chat::{ HistoryStats, Message, Role };

/// What actually sits under a history key.
#[derive(Serialize, Deserialize, Default)]
struct StoredHistory {
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    updated_at: i64,
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub removed: usize,
}

/// The storage location of one identity's history.
#[async_trait]
trait HistorySlot: Send + Sync {
    fn key(&self) -> &str;

    async fn fetch(&self) -> Result<Option<String>, BackendError>;

    async fn save(&self, record: &StoredHistory, payload: &str) -> Result<bool, BackendError>;

    async fn remove(&self) -> Result<bool, BackendError>;

    fn is_expired(&self, record: &StoredHistory) -> bool;
}

struct DurableSlot<'a> {
    store: &'a dyn DurableStore,
    key: String,
}

#[async_trait]
impl HistorySlot for DurableSlot<'_> {
    fn key(&self) -> &str {
        &self.key
    }

    async fn fetch(&self) -> Result<Option<String>, BackendError> {
        self.store.get(&self.key).await
    }

    async fn save(&self, _record: &StoredHistory, payload: &str) -> Result<bool, BackendError> {
        self.store.set(&self.key, payload).await
    }

    async fn remove(&self) -> Result<bool, BackendError> {
        self.store.delete(&self.key).await
    }

    fn is_expired(&self, _record: &StoredHistory) -> bool {
        false
    }
}

struct EphemeralSlot<'a> {
    store: &'a dyn EphemeralStore,
    key: String,
    timeout_secs: u64,
    expiry: ExpiryPolicy,
    now: DateTime<Utc>,
}

/// Seconds since the record's expiry clock started.
fn record_age(record: &StoredHistory, expiry: ExpiryPolicy, now: DateTime<Utc>) -> i64 {
    let started = match expiry {
        ExpiryPolicy::Sliding => record.updated_at,
        ExpiryPolicy::Fixed => record.created_at,
    };
    now.timestamp() - started
}

fn timeout_reached(age: i64, timeout_secs: u64) -> bool {
    age >= i64::try_from(timeout_secs).unwrap_or(i64::MAX)
}

#[async_trait]
impl HistorySlot for EphemeralSlot<'_> {
    fn key(&self) -> &str {
        &self.key
    }

    async fn fetch(&self) -> Result<Option<String>, BackendError> {
        self.store.get(&self.key).await
    }

    async fn save(&self, record: &StoredHistory, payload: &str) -> Result<bool, BackendError> {
        let age = u64::try_from(record_age(record, self.expiry, self.now)).unwrap_or(0);
        let ttl = self.timeout_secs.saturating_sub(age).max(1);
        self.store.set(&self.key, payload, ttl).await
    }

    async fn remove(&self) -> Result<bool, BackendError> {
        self.store.delete(&self.key).await
    }

    fn is_expired(&self, record: &StoredHistory) -> bool {
        timeout_reached(record_age(record, self.expiry, self.now), self.timeout_secs)
    }
}

/// Hands out one async mutex per storage key so read-modify-write cycles on
/// the same history never interleave inside this process.
#[derive(Default)]
struct KeyLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Entries only referenced by the table are idle.
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        locks.entry(key.to_string()).or_default().clone()
    }
}

/// Bounded per-identity chat history over a durable store (registered users)
/// and an expiring store (guests).
///
/// Appends and clears are serialized per key within one process. Several
/// processes sharing a backend can still lose an update when two of them
/// append to the same history at the same moment.
pub struct ChatHistory {
    durable: Arc<dyn DurableStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    config: HistoryConfig,
    locks: KeyLocks,
}

impl ChatHistory {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        config: HistoryConfig
    ) -> Self {
        Self {
            durable,
            ephemeral,
            clock,
            config,
            locks: KeyLocks::default(),
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    fn guest_prefix(&self) -> String {
        format!("{}_guest_", self.config.session_key)
    }

    fn slot(&self, identity: &Identity, now: DateTime<Utc>) -> Box<dyn HistorySlot + '_> {
        match identity {
            Identity::RegisteredUser(id) =>
                Box::new(DurableSlot {
                    store: self.durable.as_ref(),
                    key: format!("{}:user:{}", self.config.session_key, id),
                }),
            Identity::Guest(guest) =>
                Box::new(EphemeralSlot {
                    store: self.ephemeral.as_ref(),
                    key: format!("{}{}", self.guest_prefix(), guest),
                    timeout_secs: self.config.timeout_secs,
                    expiry: self.config.expiry,
                    now,
                }),
        }
    }

    /// Loads the live record behind a slot. Unreadable or expired records count as absent.
    async fn load(&self, slot: &dyn HistorySlot) -> Result<Option<StoredHistory>, HistoryError> {
        let Some(raw) = slot.fetch().await? else {
            return Ok(None);
        };
        let record = match serde_json::from_str::<StoredHistory>(&raw) {
            Ok(record) => record,
            Err(e) => {
                error!("Error parsing history entry {}: {}", slot.key(), e);
                return Ok(None);
            }
        };
        if slot.is_expired(&record) {
            debug!("Ignoring expired history {}", slot.key());
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub async fn append(
        &self,
        identity: &Identity,
        content: &str,
        role: Role
    ) -> Result<Message, HistoryError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(HistoryError::EmptyContent);
        }

        let now = self.clock.now();
        let message = Message {
            content: content.to_string(),
            role,
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            id: format!("msg_{}", Uuid::new_v4().simple()),
        };

        let slot = self.slot(identity, now);
        let lock = self.locks.lock_for(slot.key());
        let _guard = lock.lock().await;

        let mut record = self.load(&*slot).await?.unwrap_or_else(|| StoredHistory {
            created_at: now.timestamp(),
            ..Default::default()
        });
        record.messages.push(message.clone());
        let overflow = record.messages.len().saturating_sub(self.config.max_length);
        if overflow > 0 {
            record.messages.drain(..overflow);
        }
        record.updated_at = now.timestamp();

        let payload = serde_json::to_string(&record)?;
        if !slot.save(&record, &payload).await? {
            return Err(HistoryError::WriteRejected(slot.key().to_string()));
        }
        debug!("Appended {} message to {} ({} stored)", message.role, identity, record.messages.len());
        Ok(message)
    }

    pub async fn get_history(&self, identity: &Identity) -> Result<Vec<Message>, HistoryError> {
        let slot = self.slot(identity, self.clock.now());
        Ok(
            self
                .load(&*slot).await?
                .map(|record| record.messages)
                .unwrap_or_default()
        )
    }

    pub async fn clear_history(&self, identity: &Identity) -> Result<bool, HistoryError> {
        let slot = self.slot(identity, self.clock.now());
        let lock = self.locks.lock_for(slot.key());
        let _guard = lock.lock().await;
        let removed = slot.remove().await?;
        info!("Cleared history for {} (existed: {})", identity, removed);
        Ok(removed)
    }

    pub async fn get_stats(&self, identity: &Identity) -> Result<HistoryStats, HistoryError> {
        let messages = self.get_history(identity).await?;
        Ok(HistoryStats::from_messages(&messages))
    }

    pub async fn export_history(
        &self,
        identity: &Identity,
        format: ExportFormat
    ) -> Result<String, HistoryError> {
        let messages = self.get_history(identity).await?;
        if messages.is_empty() {
            return Err(HistoryError::EmptyHistory);
        }
        format.render(&messages)
    }

    fn is_stale(&self, raw: &str, now: DateTime<Utc>) -> bool {
        match serde_json::from_str::<StoredHistory>(raw) {
            Ok(record) =>
                timeout_reached(
                    record_age(&record, self.config.expiry, now),
                    self.config.timeout_secs
                ),
            Err(_) => true,
        }
    }

    /// Deletes one guest key if it is still stale once its lock is held, so an
    /// append that landed after the scan survives the sweep.
    async fn remove_if_stale(&self, key: &str) -> Result<bool, BackendError> {
        let lock = self.locks.lock_for(key);
        let _guard = lock.lock().await;
        match self.ephemeral.get(key).await? {
            Some(raw) if self.is_stale(&raw, self.clock.now()) => self.ephemeral.delete(key).await,
            _ => Ok(false),
        }
    }

    /// Removes guest histories past their timeout. Keys are judged without any
    /// lock; only a key found stale is locked while it is re-checked and
    /// deleted. Keys that vanish mid-sweep are skipped, so concurrent sweeps
    /// are harmless.
    pub async fn cleanup_expired(&self) -> Result<CleanupReport, HistoryError> {
        let now = self.clock.now();
        let keys = self.ephemeral.scan_prefix(&self.guest_prefix()).await?;
        let mut report = CleanupReport { scanned: keys.len(), removed: 0 };

        for key in keys {
            let raw = match self.ephemeral.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    continue;
                }
                Err(e) => {
                    warn!("Skipping {} during cleanup: {}", key, e);
                    continue;
                }
            };
            if !self.is_stale(&raw, now) {
                continue;
            }
            match self.remove_if_stale(&key).await {
                Ok(true) => {
                    report.removed += 1;
                }
                Ok(false) => debug!("{} was refreshed or removed during cleanup", key),
                Err(e) => warn!("Failed to delete {} during cleanup: {}", key, e),
            }
        }

        if report.removed > 0 {
            info!("Cleanup removed {} of {} guest histories", report.removed, report.scanned);
        } else {
            debug!("Cleanup found nothing to remove ({} scanned)", report.scanned);
        }
        Ok(report)
    }
}

mod clock;
mod error;
mod export;
mod identity;
mod memory;
mod redis;
mod service;

use async_trait::async_trait;
use log::info;
use std::error::Error;
use std::sync::Arc;
use crate::cli::{ Args, ExpiryPolicy };

pub use clock::{ Clock, ManualClock, SystemClock, TIMESTAMP_FORMAT };
pub use error::{ BackendError, HistoryError };
pub use export::ExportFormat;
pub use identity::{ guest_key, resolve_identity, Identity, RequestContext };
pub use memory::MemoryHistoryBackend;
pub use self::redis::RedisHistoryBackend;
pub use service::{ ChatHistory, CleanupReport };

/// Keyed storage without expiry, used for registered users.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set(&self, key: &str, value: &str) -> Result<bool, BackendError>;

    async fn delete(&self, key: &str) -> Result<bool, BackendError>;
}

/// Keyed storage whose entries expire on their own, used for guests.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool, BackendError>;

    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Keys starting with `prefix`. May include entries that are already expired.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError>;
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub session_key: String,
    pub max_length: usize,
    pub timeout_secs: u64,
    pub expiry: ExpiryPolicy,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            session_key: "ai_chat_history".to_string(),
            max_length: 50,
            timeout_secs: 3600,
            expiry: ExpiryPolicy::Sliding,
        }
    }
}

impl HistoryConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            session_key: args.history_session_key.clone(),
            max_length: args.history_max_length.max(1),
            timeout_secs: args.history_timeout.max(1),
            expiry: args.history_expiry,
        }
    }
}

pub fn create_history_store(
    args: &Args,
    clock: Arc<dyn Clock>
) -> Result<ChatHistory, Box<dyn Error + Send + Sync>> {
    let config = HistoryConfig::from_args(args);
    match args.history_type.to_lowercase().as_str() {
        "redis" => {
            let backend = Arc::new(
                RedisHistoryBackend::new(&args.history_host, args.history_redis_scan_count)?
            );
            Ok(ChatHistory::new(backend.clone(), backend, clock, config))
        }
        "memory" => {
            let backend = Arc::new(MemoryHistoryBackend::new(clock.clone()));
            Ok(ChatHistory::new(backend.clone(), backend, clock, config))
        }
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported history store type: {}", args.history_type)
                    )
                )
            ),
    }
}

pub fn initialize_history_store(
    args: &Args
) -> Result<Arc<ChatHistory>, Box<dyn Error + Send + Sync>> {
    info!("Chat history will be stored in: {} at {}", args.history_type, args.history_host);
    let store = create_history_store(args, Arc::new(SystemClock))?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn rejects_unknown_store_type() {
        let args = Args::parse_from(["chat-history", "--history-type", "sqlite"]);
        let err = create_history_store(&args, Arc::new(SystemClock)).err().unwrap();
        assert!(err.to_string().contains("sqlite"));
    }

    #[test]
    fn builds_memory_store() {
        let args = Args::parse_from(["chat-history", "--history-type", "memory"]);
        let store = create_history_store(&args, Arc::new(SystemClock)).unwrap();
        assert_eq!(store.config().max_length, 50);
    }

    #[test]
    fn config_clamps_degenerate_limits() {
        let args = Args::parse_from([
            "chat-history",
            "--history-max-length",
            "0",
            "--history-timeout",
            "0",
        ]);
        let config = HistoryConfig::from_args(&args);
        assert_eq!(config.max_length, 1);
        assert_eq!(config.timeout_secs, 1);
    }
}

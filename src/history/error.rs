use thiserror::Error;

/// Failures reported by a storage backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Message content is empty")]
    EmptyContent,

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("No history to export")]
    EmptyHistory,

    #[error("Backend refused to store {0}")]
    WriteRejected(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HistoryError {
    /// True when the caller supplied something unusable, as opposed to a storage failure.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, HistoryError::EmptyContent | HistoryError::UnsupportedFormat(_))
    }
}

//! Cache error types

use redis::RedisError;

/// Boxed error returned by caller-supplied backing stores and refresh functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Encoded entry is larger than `max_entry_size`; the write is skipped
    #[error("Entry too large: {size} bytes exceeds limit of {max} bytes")]
    EntryTooLarge { size: usize, max: usize },

    #[error("Backend operation timed out: {0}")]
    Timeout(String),

    /// A resource is bound to a pattern that cannot serve the requested operation
    #[error("Invalid strategy: {0}")]
    InvalidStrategy(String),

    /// Request shape the resolved pattern cannot serve, e.g. a batch write
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BoxError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl CacheError {
    /// Wrap any caller error as a backing-store failure
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Backend(err.into())
    }
}

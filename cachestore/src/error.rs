//! Error types for the key-value store layer.

use thiserror::Error;

/// Errors raised by [`KvStore`](crate::storage::KvStore) backends.
///
/// These never escape [`CacheClient`](crate::client::CacheClient); the client
/// logs them and degrades to the operation's empty value.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transport or protocol failure talking to Redis
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Glob pattern could not be compiled
    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Key holds a value of a different shape (e.g. a hash read as a list)
    #[error("Wrong type for key: {0}")]
    WrongType(String),

    /// Store configuration is unusable
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Store could not be reached in time
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

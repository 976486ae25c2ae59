//! Error types for the scheduler.

use thiserror::Error;

/// Scheduler errors.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Configuration error. Fatal at startup; never produced inside the loop.
    #[error("configuration error: {0}")]
    Config(String),

    /// Document store error outside the SQL layer.
    #[error("store error: {0}")]
    Store(String),

    /// SQL-level document store error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Malformed document encountered while decoding.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Metadata record missing or unusable for a database.
    #[error("metadata for {db} is unusable: {reason}")]
    Metadata {
        /// Database whose metadata was rejected.
        db: String,
        /// Why the record cannot drive scheduling.
        reason: String,
    },

    /// Lock acquisition exhausted its retry budget.
    #[error("failed to acquire lock {0}")]
    Lock(String),

    /// A held lock outlived its TTL before the pass completed.
    #[error("lock {0} expired before the pass completed")]
    LockExpired(String),

    /// Queue publish failure.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Valkey/Redis pool error.
    #[error("valkey error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Redis command error.
    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    /// Create a store error.
    #[must_use]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a `KvStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached. Lock acquisition treats this
    /// as fatal and never grants the lock.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by `LockProvider`.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {key}")]
    Timeout { key: String, waited: Duration },

    #[error("lock store unavailable while acquiring {key}: {source}")]
    Unavailable {
        key: String,
        #[source]
        source: StoreError,
    },
}

/// Invalid `LockConfig` values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("lock ttl must be greater than zero")]
    ZeroTtl,

    #[error("initial backoff must be greater than zero")]
    ZeroBackoff,

    #[error("max backoff {max:?} is below initial backoff {initial:?}")]
    BackoffBounds { initial: Duration, max: Duration },
}

/// Errors raised while decoding a sync frame. All of them are reported as
/// `MALFORMED_FRAME`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("sync frame is missing its sync step byte")]
    MissingSyncStep,

    #[error("unknown sync step {0}")]
    UnknownSyncStep(u8),
}

impl ProtocolError {
    pub const fn code(&self) -> &'static str {
        "MALFORMED_FRAME"
    }
}

/// Errors raised by a `DocumentStore`.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid document path component: {0:?}")]
    InvalidPath(String),
}

//! Errors surfaced by the concurrency layer.

use std::fmt;
use std::time::Duration;

use docsync_core::LockError;
use thiserror::Error;

/// Reason code carried by every `ConcurrencyError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    LockTimeout,
    OperationFailed,
    ProviderUnavailable,
    Cancelled,
    Rejected,
}

impl ReasonCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ReasonCode::LockTimeout => "LOCK_TIMEOUT",
            ReasonCode::OperationFailed => "OPERATION_FAILED",
            ReasonCode::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            ReasonCode::Cancelled => "CANCELLED",
            ReasonCode::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConcurrencyError {
    #[error("timed out after {waited:?} acquiring lock {resource}")]
    LockTimeout { resource: String, waited: Duration },

    /// The operation ran under the lock and failed. The lock was released
    /// before this error was returned.
    #[error("operation on {resource} failed: {source}")]
    OperationFailed {
        resource: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("lock provider unavailable for {resource}: {source}")]
    ProviderUnavailable {
        resource: String,
        #[source]
        source: LockError,
    },

    #[error("operation on {resource} was cancelled")]
    Cancelled { resource: String },

    #[error("operation on {resource} rejected: service is shut down")]
    Rejected { resource: String },
}

impl ConcurrencyError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            ConcurrencyError::LockTimeout { .. } => ReasonCode::LockTimeout,
            ConcurrencyError::OperationFailed { .. } => ReasonCode::OperationFailed,
            ConcurrencyError::ProviderUnavailable { .. } => ReasonCode::ProviderUnavailable,
            ConcurrencyError::Cancelled { .. } => ReasonCode::Cancelled,
            ConcurrencyError::Rejected { .. } => ReasonCode::Rejected,
        }
    }

    /// Resource key the failed operation targeted.
    pub fn resource(&self) -> &str {
        match self {
            ConcurrencyError::LockTimeout { resource, .. }
            | ConcurrencyError::OperationFailed { resource, .. }
            | ConcurrencyError::ProviderUnavailable { resource, .. }
            | ConcurrencyError::Cancelled { resource }
            | ConcurrencyError::Rejected { resource } => resource,
        }
    }

    pub(crate) fn from_lock(resource: &str, err: LockError) -> Self {
        match err {
            LockError::Timeout { waited, .. } => ConcurrencyError::LockTimeout {
                resource: resource.to_string(),
                waited,
            },
            unavailable @ LockError::Unavailable { .. } => ConcurrencyError::ProviderUnavailable {
                resource: resource.to_string(),
                source: unavailable,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ConcurrencyError>;

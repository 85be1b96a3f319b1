//! Error types for the sync server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use docsync_concurrency::ConcurrencyError;
use docsync_core::{PersistenceError, ProtocolError};
use serde::Serialize;

use crate::merge::MergeError;

/// Errors from handling one sync frame.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("malformed frame: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

impl CoordinatorError {
    /// Stable code for logs and close frames.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::Protocol(e) => e.code(),
            CoordinatorError::Concurrency(e) => e.reason().as_str(),
            CoordinatorError::Merge(_) => "MERGE_FAILED",
            CoordinatorError::Persistence(_) => "PERSISTENCE_FAILED",
        }
    }
}

/// HTTP-level errors, returned before a WebSocket is upgraded.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Server is shutting down")]
    ShuttingDown,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
            code: &'static str,
        }

        let (status, code) = match &self {
            ServerError::InvalidIdentifier(_) => (StatusCode::BAD_REQUEST, "INVALID_IDENTIFIER"),
            ServerError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
        };

        let body = ErrorBody {
            error: self.to_string(),
            code,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

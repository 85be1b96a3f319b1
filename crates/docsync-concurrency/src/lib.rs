//! Concurrency control for docsync.
//!
//! `ConcurrencyService` runs operations inside distributed critical sections
//! at document or workspace granularity, either on the caller's task or on
//! an owned worker pool, and batches multi-document work under one
//! workspace lock.

mod error;
mod pool;
mod service;
mod state;
mod stats;

pub use error::{ConcurrencyError, ReasonCode, Result};
pub use pool::WorkerPool;
pub use service::{
    document_key, workspace_key, ConcurrencyConfig, ConcurrencyService, OperationHandle,
};
pub use state::{OperationState, OperationTracker};
pub use stats::ConcurrencyStats;

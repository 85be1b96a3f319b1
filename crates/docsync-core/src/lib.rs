//! Core traits and types for the docsync collaboration backend.
//!
//! This crate defines the pieces shared between the concurrency layer, the
//! storage backends and the sync server:
//! - `KvStore`: the four-primitive shared store that backs distributed locks
//! - `LockProvider`: distributed mutual exclusion keyed by resource name
//! - `DocState`: in-memory document content with version and dirty tracking
//! - `SyncMessage`: the binary sync protocol frame codec
//! - `DocumentStore`: persistence collaborator for document content

mod doc_state;
mod error;
mod lock;
mod persistence;
mod protocol;

pub use doc_state::DocState;
pub use error::{ConfigError, LockError, PersistenceError, ProtocolError, StoreError};
pub use lock::{KvStore, LockConfig, LockHandle, LockProvider};
pub use persistence::{DocumentStore, StoredDocument};
pub use protocol::{MessageKind, SyncMessage, SyncStep};

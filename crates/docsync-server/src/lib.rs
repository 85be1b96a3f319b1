//! WebSocket sync server for docsync.
//!
//! Clients connect to `/sync/{workspace_id}/{doc_id}` and exchange binary
//! sync frames. `SyncCoordinator` applies updates under the document's
//! distributed lock, persists them and fans them out to the document's other
//! sessions.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod merge;
pub mod session;

pub use config::{Config, LockStoreKind};
pub use coordinator::SyncCoordinator;
pub use error::{CoordinatorError, ServerError};
pub use handlers::{health_handler, sync_handler, AppState};
pub use merge::{CrdtMerge, MergeError, MergeOutcome, UpdateLogMerge};
pub use session::{JoinedSession, SessionId, SessionRegistry};

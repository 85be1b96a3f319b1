//! Local backends for docsync.
//!
//! - `MemoryKvStore`: lock store scoped to one process
//! - `FileKvStore`: lock store shared through a directory, safe across processes
//! - `FsDocumentStore`: document persistence on the local filesystem

pub mod document;
pub mod file;
pub mod memory;

pub use document::FsDocumentStore;
pub use file::FileKvStore;
pub use memory::MemoryKvStore;

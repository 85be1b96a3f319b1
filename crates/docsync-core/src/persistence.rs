use async_trait::async_trait;

use crate::error::PersistenceError;

/// A persisted document snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub content: Vec<u8>,
    pub version: u64,
}

/// Persistence collaborator for document content.
///
/// Callers hold the document lock around `save`, and call
/// `DocState::mark_clean` only after it succeeds.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn load(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Option<StoredDocument>, PersistenceError>;

    async fn save(
        &self,
        workspace_id: &str,
        doc_id: &str,
        content: &[u8],
        version: u64,
    ) -> Result<(), PersistenceError>;

    /// Version of the persisted snapshot, or `None` if nothing is stored.
    /// Backends that keep the version apart from the content should
    /// override this to skip reading the content.
    async fn stored_version(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Option<u64>, PersistenceError> {
        Ok(self.load(workspace_id, doc_id).await?.map(|doc| doc.version))
    }
}

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docsync_core::{DocumentStore, PersistenceError, StoredDocument};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, instrument};

#[derive(Debug, Serialize, Deserialize)]
struct DocumentMeta {
    version: u64,
    saved_at: DateTime<Utc>,
}

/// Filesystem `DocumentStore`.
///
/// Layout:
/// ```text
/// {base_dir}/
///   {workspace_id}/
///     {doc_id}.bin         # document content
///     {doc_id}.meta.json   # {"version": ..., "saved_at": ...}
/// ```
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    base_dir: PathBuf,
}

impl FsDocumentStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Reject identifiers that could escape the base directory.
    fn check_component(id: &str) -> Result<&str, PersistenceError> {
        if id.is_empty()
            || id == "."
            || id == ".."
            || id.contains(['/', '\\', '\0'])
        {
            return Err(PersistenceError::InvalidPath(id.to_string()));
        }
        Ok(id)
    }

    fn doc_paths(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<(PathBuf, PathBuf, PathBuf), PersistenceError> {
        let dir = self.base_dir.join(Self::check_component(workspace_id)?);
        let doc_id = Self::check_component(doc_id)?;
        let content = dir.join(format!("{}.bin", doc_id));
        let meta = dir.join(format!("{}.meta.json", doc_id));
        Ok((dir, content, meta))
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, data)
        .await
        .map_err(|e| PersistenceError::Io(format!("write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| PersistenceError::Io(format!("rename to {}: {}", path.display(), e)))
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    fn backend_name(&self) -> &'static str {
        "fs"
    }

    #[instrument(skip(self), level = "debug")]
    async fn load(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Option<StoredDocument>, PersistenceError> {
        let (_, content_path, meta_path) = self.doc_paths(workspace_id, doc_id)?;

        let content = match fs::read(&content_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("document not found: {}", content_path.display());
                return Ok(None);
            }
            Err(e) => return Err(PersistenceError::Io(e.to_string())),
        };

        let version = match fs::read(&meta_path).await {
            Ok(data) => {
                let meta: DocumentMeta = serde_json::from_slice(&data).map_err(|e| {
                    PersistenceError::Serialization(format!("failed to parse meta: {}", e))
                })?;
                meta.version
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(PersistenceError::Io(e.to_string())),
        };

        Ok(Some(StoredDocument { content, version }))
    }

    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    async fn save(
        &self,
        workspace_id: &str,
        doc_id: &str,
        content: &[u8],
        version: u64,
    ) -> Result<(), PersistenceError> {
        let (dir, content_path, meta_path) = self.doc_paths(workspace_id, doc_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PersistenceError::Io(format!("create {}: {}", dir.display(), e)))?;

        let meta = serde_json::to_vec(&DocumentMeta {
            version,
            saved_at: Utc::now(),
        })
        .map_err(|e| PersistenceError::Serialization(e.to_string()))?;

        write_atomic(&content_path, content).await?;
        write_atomic(&meta_path, &meta).await?;

        debug!("saved {}/{} at version {}", workspace_id, doc_id, version);
        Ok(())
    }

    async fn stored_version(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Option<u64>, PersistenceError> {
        let (_, content_path, meta_path) = self.doc_paths(workspace_id, doc_id)?;

        match fs::read(&meta_path).await {
            Ok(data) => {
                let meta: DocumentMeta = serde_json::from_slice(&data).map_err(|e| {
                    PersistenceError::Serialization(format!("failed to parse meta: {}", e))
                })?;
                Ok(Some(meta.version))
            }
            // Content without meta loads as version 0.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let exists = fs::try_exists(&content_path)
                    .await
                    .map_err(|e| PersistenceError::Io(e.to_string()))?;
                Ok(exists.then_some(0))
            }
            Err(e) => Err(PersistenceError::Io(e.to_string())),
        }
    }
}

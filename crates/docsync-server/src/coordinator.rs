//! Synchronization coordinator.
//!
//! Routes decoded sync frames to the document they target. Every read or
//! write of a document's content happens under its distributed document
//! lock; broadcasts to the other sessions go out after the lock is released.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use docsync_concurrency::{ConcurrencyError, ConcurrencyService};
use docsync_core::{DocState, DocumentStore, MessageKind, SyncMessage, SyncStep};
use tracing::{debug, info, instrument, warn};

use crate::error::{CoordinatorError, Result};
use crate::merge::CrdtMerge;
use crate::session::{JoinedSession, SessionId, SessionRegistry};

type DocKey = (String, String);

fn doc_key(workspace_id: &str, doc_id: &str) -> DocKey {
    (workspace_id.to_string(), doc_id.to_string())
}

/// Errors raised inside a locked operation come back wrapped in
/// `OperationFailed`; unwrap them so callers see the original error.
fn unwrap_operation(err: ConcurrencyError) -> CoordinatorError {
    match err {
        ConcurrencyError::OperationFailed { resource, source } => {
            match source.downcast::<CoordinatorError>() {
                Ok(inner) => inner,
                Err(source) => ConcurrencyError::OperationFailed { resource, source }.into(),
            }
        }
        other => other.into(),
    }
}

pub struct SyncCoordinator {
    concurrency: ConcurrencyService,
    merge: Arc<dyn CrdtMerge>,
    store: Arc<dyn DocumentStore>,
    sessions: SessionRegistry,
    /// Loaded documents. The mutex is only held for in-memory reads and
    /// writes, never across an await.
    docs: DashMap<DocKey, Arc<Mutex<DocState>>>,
}

impl SyncCoordinator {
    pub fn new(
        concurrency: ConcurrencyService,
        merge: Arc<dyn CrdtMerge>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            concurrency,
            merge,
            store,
            sessions: SessionRegistry::new(),
            docs: DashMap::new(),
        }
    }

    pub fn concurrency(&self) -> &ConcurrencyService {
        &self.concurrency
    }

    pub fn store_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn merge_name(&self) -> &'static str {
        self.merge.name()
    }

    /// Number of documents currently held in memory.
    pub fn loaded_documents(&self) -> usize {
        self.docs.len()
    }

    pub async fn session_count(&self, workspace_id: &str, doc_id: &str) -> usize {
        self.sessions.session_count(workspace_id, doc_id).await
    }

    /// Version and dirty flag of a loaded document.
    pub fn document_status(&self, workspace_id: &str, doc_id: &str) -> Option<(u64, bool)> {
        let state = self.docs.get(&doc_key(workspace_id, doc_id))?;
        let guard = state.lock().expect("doc state poisoned");
        Some((guard.version(), guard.is_dirty()))
    }

    pub async fn join(&self, workspace_id: &str, doc_id: &str) -> JoinedSession {
        self.sessions.join(workspace_id, doc_id).await
    }

    /// Handle one binary frame from `session`. Returns the replies addressed
    /// to that session. A frame that fails to decode changes nothing.
    #[instrument(skip(self, frame), fields(len = frame.len()), level = "debug")]
    pub async fn handle_frame(
        &self,
        workspace_id: &str,
        doc_id: &str,
        session: SessionId,
        frame: &[u8],
    ) -> Result<Vec<SyncMessage>> {
        let message = SyncMessage::decode(frame)?;

        match message.kind() {
            MessageKind::Sync(SyncStep::Step1) => {
                let diff = self
                    .concurrency
                    .with_document_lock(workspace_id, doc_id, || {
                        self.diff_locked(workspace_id, doc_id, message.payload())
                    })
                    .await
                    .map_err(unwrap_operation)?;
                Ok(vec![SyncMessage::step2(diff)])
            }
            MessageKind::Sync(SyncStep::Step2) | MessageKind::Sync(SyncStep::Update) => {
                let outgoing = self
                    .concurrency
                    .with_document_lock(workspace_id, doc_id, || {
                        self.apply_locked(workspace_id, doc_id, message.payload())
                    })
                    .await
                    .map_err(unwrap_operation)?;
                if let Some(update) = outgoing {
                    self.sessions
                        .broadcast(workspace_id, doc_id, session, &SyncMessage::update(update))
                        .await;
                }
                Ok(Vec::new())
            }
            MessageKind::Awareness => {
                self.sessions
                    .set_awareness(workspace_id, doc_id, session, message.payload().clone())
                    .await;
                self.sessions
                    .broadcast(workspace_id, doc_id, session, &message)
                    .await;
                Ok(Vec::new())
            }
            MessageKind::QueryAwareness => Ok(self
                .sessions
                .awareness_snapshot(workspace_id, doc_id)
                .await
                .into_iter()
                .map(SyncMessage::awareness)
                .collect()),
            MessageKind::Auth => {
                debug!(workspace_id, doc_id, session, "ignoring auth frame");
                Ok(Vec::new())
            }
        }
    }

    /// Unregister a session. When it was the document's last one, the
    /// document is flushed if dirty and evicted, under its lock.
    #[instrument(skip(self), level = "debug")]
    pub async fn leave(&self, workspace_id: &str, doc_id: &str, session: SessionId) -> Result<()> {
        let remaining = self.sessions.leave(workspace_id, doc_id, session).await;
        if remaining > 0 || !self.docs.contains_key(&doc_key(workspace_id, doc_id)) {
            return Ok(());
        }

        self.concurrency
            .with_document_lock(workspace_id, doc_id, || self.evict_locked(workspace_id, doc_id))
            .await
            .map_err(unwrap_operation)
    }

    /// Flush every dirty document, then shut the concurrency service down.
    pub async fn shutdown(&self) {
        let keys: Vec<DocKey> = self.docs.iter().map(|e| e.key().clone()).collect();
        let mut flushed = 0;
        for (workspace_id, doc_id) in keys {
            let result = self
                .concurrency
                .with_document_lock(&workspace_id, &doc_id, || {
                    self.flush_locked(&workspace_id, &doc_id)
                })
                .await
                .map_err(unwrap_operation);
            match result {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    workspace_id = %workspace_id,
                    doc_id = %doc_id,
                    code = e.code(),
                    "failed to flush document on shutdown: {}",
                    e
                ),
            }
        }
        info!(flushed, "documents flushed");
        self.concurrency.shutdown().await;
    }

    // =========================================================================
    // Locked sections. Callers must hold the document lock.
    // =========================================================================

    /// Get the loaded document, loading it from the store on first use.
    ///
    /// A cached copy is checked against the stored version first: another
    /// instance may have written the document since it was loaded here.
    async fn load_locked(&self, workspace_id: &str, doc_id: &str) -> Result<Arc<Mutex<DocState>>> {
        let key = doc_key(workspace_id, doc_id);
        let cached = self.docs.get(&key).map(|e| Arc::clone(e.value()));
        if let Some(state) = cached {
            let cached_version = state.lock().expect("doc state poisoned").version();
            let stored_version = self.store.stored_version(workspace_id, doc_id).await?;
            if stored_version.is_none_or(|v| v <= cached_version) {
                return Ok(state);
            }

            if let Some(stored) = self.store.load(workspace_id, doc_id).await? {
                debug!(
                    workspace_id,
                    doc_id,
                    cached_version,
                    version = stored.version,
                    "cached document is stale, reloaded"
                );
                *state.lock().expect("doc state poisoned") =
                    DocState::from_stored(stored.content, stored.version);
            }
            return Ok(state);
        }

        let state = match self.store.load(workspace_id, doc_id).await? {
            Some(stored) => {
                debug!(workspace_id, doc_id, version = stored.version, "loaded document");
                DocState::from_stored(stored.content, stored.version)
            }
            None => DocState::new(),
        };
        let entry = self
            .docs
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(state)));
        Ok(Arc::clone(entry.value()))
    }

    async fn diff_locked(
        &self,
        workspace_id: &str,
        doc_id: &str,
        state_vector: &[u8],
    ) -> Result<Bytes> {
        let state = self.load_locked(workspace_id, doc_id).await?;
        let guard = state.lock().expect("doc state poisoned");
        Ok(self.merge.encode_diff(guard.content(), state_vector)?)
    }

    async fn apply_locked(
        &self,
        workspace_id: &str,
        doc_id: &str,
        update: &[u8],
    ) -> Result<Option<Bytes>> {
        let state = self.load_locked(workspace_id, doc_id).await?;

        let (outcome, version) = {
            let guard = state.lock().expect("doc state poisoned");
            let outcome = self.merge.apply_update(guard.content(), update)?;
            if outcome.broadcast.is_none() && outcome.content == guard.content() {
                return Ok(None);
            }
            (outcome, guard.version() + 1)
        };

        // The cached state only moves once the new content is durable.
        self.store
            .save(workspace_id, doc_id, &outcome.content, version)
            .await?;
        {
            let mut guard = state.lock().expect("doc state poisoned");
            guard.update(outcome.content);
            guard.mark_clean();
        }
        debug!(workspace_id, doc_id, version, "applied update");

        Ok(outcome.broadcast)
    }

    /// Persist the document if it is dirty. Returns whether it was written.
    async fn flush_locked(&self, workspace_id: &str, doc_id: &str) -> Result<bool> {
        let Some(state) = self
            .docs
            .get(&doc_key(workspace_id, doc_id))
            .map(|e| Arc::clone(e.value()))
        else {
            return Ok(false);
        };

        let snapshot = {
            let guard = state.lock().expect("doc state poisoned");
            guard
                .is_dirty()
                .then(|| (guard.content().to_vec(), guard.version()))
        };
        let Some((content, version)) = snapshot else {
            return Ok(false);
        };

        self.store.save(workspace_id, doc_id, &content, version).await?;
        state.lock().expect("doc state poisoned").mark_clean();
        Ok(true)
    }

    async fn evict_locked(&self, workspace_id: &str, doc_id: &str) -> Result<()> {
        if self.sessions.session_count(workspace_id, doc_id).await > 0 {
            return Ok(());
        }
        self.flush_locked(workspace_id, doc_id).await?;
        self.docs.remove(&doc_key(workspace_id, doc_id));
        debug!(workspace_id, doc_id, "evicted document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::UpdateLogMerge;
    use async_trait::async_trait;
    use docsync_concurrency::ConcurrencyConfig;
    use docsync_core::{KvStore, LockConfig, LockProvider, PersistenceError, StoredDocument};
    use docsync_local::{FsDocumentStore, MemoryKvStore};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn coordinator_on(kv: Arc<dyn KvStore>, store: Arc<dyn DocumentStore>) -> SyncCoordinator {
        let provider = Arc::new(LockProvider::new(kv, LockConfig::default()).unwrap());
        let concurrency = ConcurrencyService::new(provider, ConcurrencyConfig::default());
        SyncCoordinator::new(concurrency, Arc::new(UpdateLogMerge), store)
    }

    fn setup() -> (SyncCoordinator, Arc<FsDocumentStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FsDocumentStore::new(temp_dir.path()));
        let coordinator = coordinator_on(Arc::new(MemoryKvStore::new()), store.clone());
        (coordinator, store, temp_dir)
    }

    /// Loads nothing and fails every write.
    struct FullDisk;

    #[async_trait]
    impl DocumentStore for FullDisk {
        fn backend_name(&self) -> &'static str {
            "full-disk"
        }

        async fn load(
            &self,
            _workspace_id: &str,
            _doc_id: &str,
        ) -> std::result::Result<Option<StoredDocument>, PersistenceError> {
            Ok(None)
        }

        async fn save(
            &self,
            _workspace_id: &str,
            _doc_id: &str,
            _content: &[u8],
            _version: u64,
        ) -> std::result::Result<(), PersistenceError> {
            Err(PersistenceError::Io("no space left on device".into()))
        }
    }

    #[tokio::test]
    async fn test_update_is_persisted_and_broadcast_to_others() {
        let (coordinator, store, _temp) = setup();
        let mut a = coordinator.join("ws", "doc").await;
        let mut b = coordinator.join("ws", "doc").await;

        let frame = SyncMessage::update(Bytes::from_static(b"hello")).encode();
        let replies = coordinator.handle_frame("ws", "doc", a.id, &frame).await.unwrap();
        assert!(replies.is_empty());

        assert_eq!(
            b.receiver.recv().await,
            Some(SyncMessage::update(Bytes::from_static(b"hello")))
        );
        assert!(a.receiver.try_recv().is_err());

        assert_eq!(coordinator.document_status("ws", "doc"), Some((1, false)));
        let stored = store.load("ws", "doc").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(UpdateLogMerge::updates(&stored.content).unwrap(), vec![&b"hello"[..]]);

        assert!(!coordinator.concurrency().is_document_locked("ws", "doc").await.unwrap());
    }

    #[tokio::test]
    async fn test_step1_replies_with_step2() {
        let (coordinator, _store, _temp) = setup();
        let a = coordinator.join("ws", "doc").await;

        let update = SyncMessage::update(Bytes::from_static(b"one")).encode();
        coordinator.handle_frame("ws", "doc", a.id, &update).await.unwrap();

        let step1 = SyncMessage::step1(Bytes::new()).encode();
        let replies = coordinator.handle_frame("ws", "doc", a.id, &step1).await.unwrap();

        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_step2());
        let records = UpdateLogMerge::updates(replies[0].payload()).unwrap();
        assert_eq!(records, vec![&b"one"[..]]);
    }

    #[tokio::test]
    async fn test_malformed_frame_changes_nothing() {
        let (coordinator, _store, _temp) = setup();
        let a = coordinator.join("ws", "doc").await;

        let err = coordinator.handle_frame("ws", "doc", a.id, &[0]).await.unwrap_err();
        assert_eq!(err.code(), "MALFORMED_FRAME");
        assert_eq!(coordinator.loaded_documents(), 0);
    }

    #[tokio::test]
    async fn test_awareness_is_broadcast_and_queryable() {
        let (coordinator, _store, _temp) = setup();
        let a = coordinator.join("ws", "doc").await;
        let mut b = coordinator.join("ws", "doc").await;

        let awareness = SyncMessage::awareness(Bytes::from_static(b"cursor"));
        coordinator
            .handle_frame("ws", "doc", a.id, &awareness.encode())
            .await
            .unwrap();
        assert_eq!(b.receiver.recv().await, Some(awareness.clone()));

        let query = SyncMessage::query_awareness().encode();
        let replies = coordinator.handle_frame("ws", "doc", b.id, &query).await.unwrap();
        assert_eq!(replies, vec![awareness]);
    }

    #[tokio::test]
    async fn test_last_leave_evicts_and_reload_restores() {
        let (coordinator, _store, _temp) = setup();
        let a = coordinator.join("ws", "doc").await;
        let frame = SyncMessage::update(Bytes::from_static(b"x")).encode();
        coordinator.handle_frame("ws", "doc", a.id, &frame).await.unwrap();
        assert_eq!(coordinator.loaded_documents(), 1);

        coordinator.leave("ws", "doc", a.id).await.unwrap();
        assert_eq!(coordinator.loaded_documents(), 0);

        let b = coordinator.join("ws", "doc").await;
        let frame = SyncMessage::update(Bytes::from_static(b"y")).encode();
        coordinator.handle_frame("ws", "doc", b.id, &frame).await.unwrap();
        assert_eq!(coordinator.document_status("ws", "doc"), Some((2, false)));
    }

    #[tokio::test]
    async fn test_instances_sharing_stores_do_not_lose_updates() {
        let temp_dir = TempDir::new().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = Arc::new(FsDocumentStore::new(temp_dir.path()));
        let first = coordinator_on(Arc::clone(&kv), store.clone());
        let second = coordinator_on(Arc::clone(&kv), store.clone());

        let a = first.join("ws", "doc").await;
        let b = second.join("ws", "doc").await;

        // The second instance caches the empty document before the first writes.
        let step1 = SyncMessage::step1(Bytes::new()).encode();
        second.handle_frame("ws", "doc", b.id, &step1).await.unwrap();
        assert_eq!(second.document_status("ws", "doc"), Some((0, false)));

        let update_a = SyncMessage::update(Bytes::from_static(b"a")).encode();
        first.handle_frame("ws", "doc", a.id, &update_a).await.unwrap();
        let update_b = SyncMessage::update(Bytes::from_static(b"b")).encode();
        second.handle_frame("ws", "doc", b.id, &update_b).await.unwrap();

        let stored = store.load("ws", "doc").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(
            UpdateLogMerge::updates(&stored.content).unwrap(),
            vec![&b"a"[..], &b"b"[..]]
        );
        assert_eq!(second.document_status("ws", "doc"), Some((2, false)));

        // A step1 on the first instance sees the second instance's write too.
        let replies = first.handle_frame("ws", "doc", a.id, &step1).await.unwrap();
        assert_eq!(
            UpdateLogMerge::updates(replies[0].payload()).unwrap(),
            vec![&b"a"[..], &b"b"[..]]
        );
    }

    #[tokio::test]
    async fn test_failed_save_leaves_state_and_peers_untouched() {
        let coordinator = coordinator_on(Arc::new(MemoryKvStore::new()), Arc::new(FullDisk));
        let a = coordinator.join("ws", "doc").await;
        let mut b = coordinator.join("ws", "doc").await;

        let frame = SyncMessage::update(Bytes::from_static(b"lost")).encode();
        let err = coordinator.handle_frame("ws", "doc", a.id, &frame).await.unwrap_err();

        assert_eq!(err.code(), "PERSISTENCE_FAILED");
        assert_eq!(coordinator.document_status("ws", "doc"), Some((0, false)));
        assert!(b.receiver.try_recv().is_err());
        assert!(!coordinator.concurrency().is_document_locked("ws", "doc").await.unwrap());

        let step1 = SyncMessage::step1(Bytes::new()).encode();
        let replies = coordinator.handle_frame("ws", "doc", b.id, &step1).await.unwrap();
        assert!(UpdateLogMerge::updates(replies[0].payload()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auth_is_ignored() {
        let (coordinator, _store, _temp) = setup();
        let a = coordinator.join("ws", "doc").await;
        let frame = SyncMessage::auth(Bytes::from_static(b"token")).encode();
        let replies = coordinator.handle_frame("ws", "doc", a.id, &frame).await.unwrap();
        assert!(replies.is_empty());
        assert_eq!(coordinator.loaded_documents(), 0);
    }
}

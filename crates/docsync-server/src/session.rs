//! Per-document session registry.
//!
//! Tracks the connected sessions of every document, their outboxes and their
//! last awareness payload, so updates and presence can be fanned out to the
//! other peers of the same document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use docsync_core::SyncMessage;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Frames buffered per session before broadcasts to it are dropped.
const OUTBOX_CAPACITY: usize = 256;

pub type SessionId = u64;

type DocKey = (String, String);

struct Peer {
    outbox: mpsc::Sender<SyncMessage>,
    awareness: Option<Bytes>,
}

#[derive(Default)]
struct DocSessions {
    peers: RwLock<HashMap<SessionId, Peer>>,
}

/// A newly registered session: its id, a sender for replies addressed to it
/// and the receiving end of its outbox.
pub struct JoinedSession {
    pub id: SessionId,
    pub sender: mpsc::Sender<SyncMessage>,
    pub receiver: mpsc::Receiver<SyncMessage>,
}

pub struct SessionRegistry {
    inner: Mutex<HashMap<DocKey, Arc<DocSessions>>>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn key(workspace_id: &str, doc_id: &str) -> DocKey {
        (workspace_id.to_string(), doc_id.to_string())
    }

    /// Get or create the entry for a document.
    fn entry(&self, workspace_id: &str, doc_id: &str) -> Arc<DocSessions> {
        let mut map = self.inner.lock().expect("session registry poisoned");
        map.entry(Self::key(workspace_id, doc_id))
            .or_default()
            .clone()
    }

    fn existing(&self, workspace_id: &str, doc_id: &str) -> Option<Arc<DocSessions>> {
        let map = self.inner.lock().expect("session registry poisoned");
        map.get(&Self::key(workspace_id, doc_id)).cloned()
    }

    pub async fn join(&self, workspace_id: &str, doc_id: &str) -> JoinedSession {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(OUTBOX_CAPACITY);
        let entry = self.entry(workspace_id, doc_id);
        entry.peers.write().await.insert(
            id,
            Peer {
                outbox: sender.clone(),
                awareness: None,
            },
        );
        debug!(workspace_id, doc_id, session = id, "session joined");
        JoinedSession {
            id,
            sender,
            receiver,
        }
    }

    /// Remove a session. Returns how many sessions the document still has.
    pub async fn leave(&self, workspace_id: &str, doc_id: &str, session: SessionId) -> usize {
        let Some(entry) = self.existing(workspace_id, doc_id) else {
            return 0;
        };
        let remaining = {
            let mut peers = entry.peers.write().await;
            peers.remove(&session);
            peers.len()
        };
        if remaining == 0 {
            let mut map = self.inner.lock().expect("session registry poisoned");
            let key = Self::key(workspace_id, doc_id);
            // Only drop the entry if nobody joined in the meantime.
            let unused = Arc::strong_count(&entry) <= 2
                && entry.peers.try_read().is_ok_and(|peers| peers.is_empty());
            if unused && map.get(&key).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                map.remove(&key);
            }
        }
        debug!(workspace_id, doc_id, session, remaining, "session left");
        remaining
    }

    pub async fn session_count(&self, workspace_id: &str, doc_id: &str) -> usize {
        match self.existing(workspace_id, doc_id) {
            Some(entry) => entry.peers.read().await.len(),
            None => 0,
        }
    }

    /// Queue `message` for every session of the document except `from`.
    /// Returns how many sessions it was queued for.
    pub async fn broadcast(
        &self,
        workspace_id: &str,
        doc_id: &str,
        from: SessionId,
        message: &SyncMessage,
    ) -> usize {
        let Some(entry) = self.existing(workspace_id, doc_id) else {
            return 0;
        };
        let peers = entry.peers.read().await;
        let mut delivered = 0;
        for (&id, peer) in peers.iter().filter(|(id, _)| **id != from) {
            match peer.outbox.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(workspace_id, doc_id, session = id, "dropping broadcast: {}", e),
            }
        }
        delivered
    }

    pub async fn set_awareness(
        &self,
        workspace_id: &str,
        doc_id: &str,
        session: SessionId,
        payload: Bytes,
    ) {
        if let Some(entry) = self.existing(workspace_id, doc_id) {
            if let Some(peer) = entry.peers.write().await.get_mut(&session) {
                peer.awareness = Some(payload);
            }
        }
    }

    /// Last awareness payload of every session of the document.
    pub async fn awareness_snapshot(&self, workspace_id: &str, doc_id: &str) -> Vec<Bytes> {
        match self.existing(workspace_id, doc_id) {
            Some(entry) => entry
                .peers
                .read()
                .await
                .values()
                .filter_map(|p| p.awareness.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let registry = SessionRegistry::new();
        let mut a = registry.join("ws", "doc").await;
        let mut b = registry.join("ws", "doc").await;
        let mut other_doc = registry.join("ws", "other").await;

        let msg = SyncMessage::update(Bytes::from_static(b"u"));
        assert_eq!(registry.broadcast("ws", "doc", a.id, &msg).await, 1);

        assert_eq!(b.receiver.recv().await, Some(msg));
        assert!(a.receiver.try_recv().is_err());
        assert!(other_doc.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_counts_down_and_clears_entry() {
        let registry = SessionRegistry::new();
        let a = registry.join("ws", "doc").await;
        let b = registry.join("ws", "doc").await;

        assert_eq!(registry.leave("ws", "doc", a.id).await, 1);
        assert_eq!(registry.leave("ws", "doc", b.id).await, 0);
        assert_eq!(registry.session_count("ws", "doc").await, 0);
        assert!(registry.existing("ws", "doc").is_none());
    }

    #[tokio::test]
    async fn test_awareness_snapshot() {
        let registry = SessionRegistry::new();
        let a = registry.join("ws", "doc").await;
        let _b = registry.join("ws", "doc").await;

        registry
            .set_awareness("ws", "doc", a.id, Bytes::from_static(b"cursor"))
            .await;

        let snapshot = registry.awareness_snapshot("ws", "doc").await;
        assert_eq!(snapshot, vec![Bytes::from_static(b"cursor")]);
    }
}

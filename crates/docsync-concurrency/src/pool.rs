//! Explicitly owned worker pool for submitted operations.
//!
//! Workers are tokio tasks on the pool's runtime handle, so the pool grows
//! with demand and idle capacity is reclaimed by the runtime. The pool only
//! adds lifecycle (accept, drain, abort) and accounting on top.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

pub struct WorkerPool {
    runtime: Handle,
    accepting: AtomicBool,
    active: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    next_id: AtomicU64,
    tasks: DashMap<u64, AbortHandle>,
    drained: Notify,
}

/// Accounting for one running worker; undone on drop, including on abort
/// and panic.
struct WorkerSlot {
    pool: Arc<WorkerPool>,
    id: u64,
}

impl WorkerSlot {
    fn enter(pool: Arc<WorkerPool>, id: u64) -> Self {
        pool.active.fetch_add(1, Ordering::SeqCst);
        Self { pool, id }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::SeqCst);
        self.pool.completed.fetch_add(1, Ordering::SeqCst);
        self.pool.tasks.remove(&self.id);
        if self.pool.tasks.is_empty() {
            self.pool.drained.notify_waiters();
        }
    }
}

impl WorkerPool {
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            accepting: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            tasks: DashMap::new(),
            drained: Notify::new(),
        })
    }

    /// Schedule `fut`. Returns `None` once shutdown has begun.
    pub fn spawn<F, T>(self: &Arc<Self>, fut: F) -> Option<JoinHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.submitted.fetch_add(1, Ordering::SeqCst);

        // The task waits until its abort handle is registered, so its slot
        // never tries to unregister before the entry exists.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let pool = Arc::clone(self);
        let handle = self.runtime.spawn(async move {
            let _ = registered_rx.await;
            let _slot = WorkerSlot::enter(pool, id);
            fut.await
        });

        self.tasks.insert(id, handle.abort_handle());
        let _ = registered_tx.send(());
        Some(handle)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Workers currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Stop accepting work and wait up to `grace` for outstanding tasks.
    /// Whatever is still outstanding afterwards is aborted. Returns the
    /// number of aborted tasks.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        debug!(outstanding = self.tasks.len(), "worker pool draining");

        let drain = async {
            loop {
                let notified = self.drained.notified();
                if self.tasks.is_empty() {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(grace, drain).await.is_ok() {
            info!("worker pool drained");
            return 0;
        }

        let ids: Vec<u64> = self.tasks.iter().map(|e| *e.key()).collect();
        let mut aborted = 0;
        for id in ids {
            if let Some((_, handle)) = self.tasks.remove(&id) {
                handle.abort();
                aborted += 1;
            }
        }
        warn!(aborted, ?grace, "worker pool grace period expired, aborted outstanding tasks");
        aborted
    }
}

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use docsync_core::{LockError, LockHandle, LockProvider};
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{ConcurrencyError, Result};
use crate::pool::WorkerPool;
use crate::state::{OperationState, OperationTracker};
use crate::stats::ConcurrencyStats;

/// Tuning for `ConcurrencyService`.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Wait budget used by the entry points that take no explicit `max_wait`.
    pub default_max_wait: Duration,
    /// How long `shutdown` lets submitted work finish before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_max_wait: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Lock key for a document.
pub fn document_key(workspace_id: &str, doc_id: &str) -> String {
    format!("doc:{}:{}", workspace_id, doc_id)
}

/// Lock key for a workspace.
pub fn workspace_key(workspace_id: &str) -> String {
    format!("workspace:{}", workspace_id)
}

/// Releases the held lock exactly once. `release` is the normal path; if the
/// scope is dropped while still armed (panic, dropped future) the release is
/// spawned onto the current runtime.
struct LockScope {
    provider: Arc<LockProvider>,
    handle: Option<LockHandle>,
}

impl LockScope {
    fn new(provider: Arc<LockProvider>, handle: LockHandle) -> Self {
        Self {
            provider,
            handle: Some(handle),
        }
    }

    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.provider.release(&handle).await;
        }
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let provider = Arc::clone(&self.provider);
        match Handle::try_current() {
            Ok(runtime) => {
                debug!(
                    key = handle.key(),
                    "lock scope dropped while held, releasing in background"
                );
                runtime.spawn(async move {
                    provider.release(&handle).await;
                });
            }
            Err(_) => warn!(
                key = handle.key(),
                "lock scope dropped outside a runtime, lock will expire by TTL"
            ),
        }
    }
}

/// What a critical section locks, and what it must not overlap with.
enum LockPlan {
    /// A document key. Not taken while the workspace key is held.
    Document { key: String, workspace: String },
    /// A workspace key. Once held, the named documents' in-flight holders
    /// are waited out.
    Workspace { key: String, documents: Vec<String> },
}

impl LockPlan {
    fn document(workspace_id: &str, doc_id: &str) -> Self {
        LockPlan::Document {
            key: document_key(workspace_id, doc_id),
            workspace: workspace_key(workspace_id),
        }
    }

    fn workspace(workspace_id: &str, doc_ids: &[String]) -> Self {
        LockPlan::Workspace {
            key: workspace_key(workspace_id),
            documents: doc_ids
                .iter()
                .map(|doc_id| document_key(workspace_id, doc_id))
                .collect(),
        }
    }

    fn key(&self) -> &str {
        match self {
            LockPlan::Document { key, .. } | LockPlan::Workspace { key, .. } => key,
        }
    }

    async fn acquire(
        &self,
        provider: &LockProvider,
        max_wait: Duration,
    ) -> std::result::Result<LockHandle, LockError> {
        match self {
            LockPlan::Document { key, workspace } => {
                provider.acquire_unless_held(key, workspace, max_wait).await
            }
            LockPlan::Workspace { key, documents } => {
                let started = Instant::now();
                let handle = provider.acquire(key, max_wait).await?;
                if documents.is_empty() {
                    return Ok(handle);
                }
                let remaining = max_wait.saturating_sub(started.elapsed());
                match provider.wait_until_free(documents, remaining).await {
                    Ok(()) => Ok(handle),
                    Err(err) => {
                        provider.release(&handle).await;
                        Err(match err {
                            LockError::Timeout { key, .. } => LockError::Timeout {
                                key,
                                waited: started.elapsed(),
                            },
                            other => other,
                        })
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic payload"
    }
}

/// Acquire the plan's key, run `op`, release. The lock is released before
/// the result is returned, including when `op` fails or panics.
async fn run_locked<T, E, F, Fut>(
    provider: &Arc<LockProvider>,
    tracker: &OperationTracker,
    plan: &LockPlan,
    max_wait: Duration,
    op: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<anyhow::Error>,
{
    let resource = tracker.resource();
    if !tracker.transition(OperationState::Pending, OperationState::Acquiring) {
        return Err(ConcurrencyError::Cancelled {
            resource: resource.to_string(),
        });
    }

    let handle = match plan.acquire(provider, max_wait).await {
        Ok(handle) => handle,
        Err(err) => {
            tracker.set(match err {
                LockError::Timeout { .. } => OperationState::TimedOut,
                LockError::Unavailable { .. } => OperationState::ProviderError,
            });
            return Err(ConcurrencyError::from_lock(resource, err));
        }
    };
    tracker.set(OperationState::Locked);
    let scope = LockScope::new(Arc::clone(provider), handle);

    tracker.set(OperationState::Running);
    let outcome = AssertUnwindSafe(async move { op().await })
        .catch_unwind()
        .await;

    scope.release().await;
    tracker.set(OperationState::Released);

    let result = match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ConcurrencyError::OperationFailed {
            resource: resource.to_string(),
            source: e.into(),
        }),
        Err(payload) => {
            warn!(resource, "operation panicked while holding the lock");
            Err(ConcurrencyError::OperationFailed {
                resource: resource.to_string(),
                source: anyhow::anyhow!("operation panicked: {}", panic_message(payload.as_ref())),
            })
        }
    };
    tracker.set(OperationState::Done);
    result
}

/// A submitted operation. Await it with `wait`, or cancel it while it is
/// still pending.
pub struct OperationHandle<T> {
    tracker: OperationTracker,
    join: JoinHandle<Result<T>>,
}

impl<T> OperationHandle<T> {
    pub fn state(&self) -> OperationState {
        self.tracker.state()
    }

    pub fn resource(&self) -> &str {
        self.tracker.resource()
    }

    /// A cloneable view of the operation's state that outlives the handle.
    pub fn tracker(&self) -> OperationTracker {
        self.tracker.clone()
    }

    /// Cancel the operation if it has not started acquiring yet. Once it is
    /// acquiring or running it completes normally and this returns `false`.
    pub fn cancel(&self) -> bool {
        self.tracker
            .transition(OperationState::Pending, OperationState::Cancelled)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<T> {
        match self.join.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_cancelled() => {
                if !self.tracker.state().is_terminal() {
                    self.tracker.set(OperationState::Cancelled);
                }
                Err(ConcurrencyError::Cancelled {
                    resource: self.tracker.resource().to_string(),
                })
            }
            Err(join_err) => Err(ConcurrencyError::OperationFailed {
                resource: self.tracker.resource().to_string(),
                source: anyhow::anyhow!("operation panicked: {}", join_err),
            }),
        }
    }
}

struct Inner {
    provider: Arc<LockProvider>,
    pool: Arc<WorkerPool>,
    config: ConcurrencyConfig,
}

/// Runs operations inside document- or workspace-scoped distributed critical
/// sections.
///
/// A document operation is not admitted while its workspace lock is held.
/// Batches take the workspace lock, then wait for in-flight holders of the
/// documents they name, so they never hold more than one lock at a time.
/// A workspace operation that names no documents only keeps new document
/// operations out; it does not wait for ones already running.
#[derive(Clone)]
pub struct ConcurrencyService {
    inner: Arc<Inner>,
}

impl ConcurrencyService {
    /// Create a service whose worker pool runs on the current tokio runtime.
    pub fn new(provider: Arc<LockProvider>, config: ConcurrencyConfig) -> Self {
        Self::with_runtime(provider, config, Handle::current())
    }

    pub fn with_runtime(
        provider: Arc<LockProvider>,
        config: ConcurrencyConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                pool: WorkerPool::new(runtime),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.inner.config
    }

    pub fn provider(&self) -> &Arc<LockProvider> {
        &self.inner.provider
    }

    /// `false` once `shutdown` has started.
    pub fn is_accepting(&self) -> bool {
        self.inner.pool.is_accepting()
    }

    fn check_open(&self, resource: &str) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(ConcurrencyError::Rejected {
                resource: resource.to_string(),
            })
        }
    }

    async fn run_on_caller<T, E, F, Fut>(
        &self,
        plan: LockPlan,
        max_wait: Duration,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.check_open(plan.key())?;
        let tracker = OperationTracker::new(plan.key());
        run_locked(&self.inner.provider, &tracker, &plan, max_wait, op).await
    }

    fn submit<T, E, F, Fut>(
        &self,
        plan: LockPlan,
        max_wait: Duration,
        op: F,
    ) -> Result<OperationHandle<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let tracker = OperationTracker::new(plan.key());
        let provider = Arc::clone(&self.inner.provider);
        let task_tracker = tracker.clone();

        let join = self
            .inner
            .pool
            .spawn(async move { run_locked(&provider, &task_tracker, &plan, max_wait, op).await })
            .ok_or_else(|| ConcurrencyError::Rejected {
                resource: tracker.resource().to_string(),
            })?;

        Ok(OperationHandle { tracker, join })
    }

    // =========================================================================
    // Blocking entry points (run on the caller's task)
    // =========================================================================

    /// Run `op` while holding the document lock, waiting up to the default
    /// budget for it.
    pub async fn with_document_lock<T, E, F, Fut>(
        &self,
        workspace_id: &str,
        doc_id: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let max_wait = self.inner.config.default_max_wait;
        self.with_document_lock_timeout(workspace_id, doc_id, max_wait, op)
            .await
    }

    #[instrument(skip(self, op), level = "debug")]
    pub async fn with_document_lock_timeout<T, E, F, Fut>(
        &self,
        workspace_id: &str,
        doc_id: &str,
        max_wait: Duration,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.run_on_caller(LockPlan::document(workspace_id, doc_id), max_wait, op)
            .await
    }

    /// Run `op` while holding the workspace lock.
    pub async fn with_workspace_lock<T, E, F, Fut>(&self, workspace_id: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let max_wait = self.inner.config.default_max_wait;
        self.with_workspace_lock_timeout(workspace_id, max_wait, op)
            .await
    }

    #[instrument(skip(self, op), level = "debug")]
    pub async fn with_workspace_lock_timeout<T, E, F, Fut>(
        &self,
        workspace_id: &str,
        max_wait: Duration,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.run_on_caller(LockPlan::workspace(workspace_id, &[]), max_wait, op)
            .await
    }

    // =========================================================================
    // Submitted entry points (run on the worker pool)
    // =========================================================================

    pub fn submit_document_operation<T, E, F, Fut>(
        &self,
        workspace_id: &str,
        doc_id: &str,
        max_wait: Option<Duration>,
        op: F,
    ) -> Result<OperationHandle<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let max_wait = max_wait.unwrap_or(self.inner.config.default_max_wait);
        self.submit(LockPlan::document(workspace_id, doc_id), max_wait, op)
    }

    pub fn submit_workspace_operation<T, E, F, Fut>(
        &self,
        workspace_id: &str,
        max_wait: Option<Duration>,
        op: F,
    ) -> Result<OperationHandle<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let max_wait = max_wait.unwrap_or(self.inner.config.default_max_wait);
        self.submit(LockPlan::workspace(workspace_id, &[]), max_wait, op)
    }

    /// Run `op` over several documents of one workspace under a single
    /// workspace lock. Document operations already running on any of them
    /// finish first. `op` receives the ids sorted and deduplicated.
    pub fn submit_batch<T, E, F, Fut, I, S>(
        &self,
        workspace_id: &str,
        doc_ids: I,
        op: F,
    ) -> Result<OperationHandle<T>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(Vec<String>) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let mut ids: Vec<String> = doc_ids.into_iter().map(Into::into).collect();
        ids.sort();
        ids.dedup();
        debug!(workspace_id, docs = ids.len(), "submitting batch under workspace lock");

        let plan = LockPlan::workspace(workspace_id, &ids);
        let max_wait = self.inner.config.default_max_wait;
        self.submit(plan, max_wait, move || op(ids))
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    async fn query_locked(&self, key: String) -> Result<bool> {
        self.inner
            .provider
            .is_locked(&key)
            .await
            .map_err(|source| unavailable(key, source))
    }

    async fn query_ttl(&self, key: String) -> Result<Option<Duration>> {
        self.inner
            .provider
            .remaining_ttl(&key)
            .await
            .map_err(|source| unavailable(key, source))
    }

    pub async fn is_document_locked(&self, workspace_id: &str, doc_id: &str) -> Result<bool> {
        self.query_locked(document_key(workspace_id, doc_id)).await
    }

    pub async fn is_workspace_locked(&self, workspace_id: &str) -> Result<bool> {
        self.query_locked(workspace_key(workspace_id)).await
    }

    pub async fn document_lock_remaining_ttl(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Option<Duration>> {
        self.query_ttl(document_key(workspace_id, doc_id)).await
    }

    pub async fn workspace_lock_remaining_ttl(
        &self,
        workspace_id: &str,
    ) -> Result<Option<Duration>> {
        self.query_ttl(workspace_key(workspace_id)).await
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let pool = &self.inner.pool;
        ConcurrencyStats {
            held_locks: self.inner.provider.held_count(),
            active_workers: pool.active(),
            submitted_tasks: pool.submitted(),
            completed_tasks: pool.completed(),
        }
    }

    /// Stop accepting work, drain the pool within the grace period, abort the
    /// rest and release any lock this instance still holds.
    pub async fn shutdown(&self) {
        let aborted = self
            .inner
            .pool
            .shutdown(self.inner.config.shutdown_grace)
            .await;
        let released = self.inner.provider.release_all().await;
        info!(aborted, released, "concurrency service shut down");
    }
}

fn unavailable(key: String, source: docsync_core::StoreError) -> ConcurrencyError {
    ConcurrencyError::ProviderUnavailable {
        resource: key.clone(),
        source: LockError::Unavailable { key, source },
    }
}

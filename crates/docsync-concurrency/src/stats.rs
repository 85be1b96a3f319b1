use serde::Serialize;

/// Point-in-time view of the concurrency layer. Recomputed on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConcurrencyStats {
    /// Locks acquired by this instance and not yet released.
    pub held_locks: usize,
    pub active_workers: usize,
    pub submitted_tasks: u64,
    pub completed_tasks: u64,
}

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::trace;

/// Lifecycle of one locked operation.
///
/// ```text
/// Pending -> Acquiring -> Locked -> Running -> Released -> Done
///                     \-> TimedOut
///                     \-> ProviderError
/// Pending -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationState {
    Pending = 0,
    Acquiring = 1,
    Locked = 2,
    Running = 3,
    Released = 4,
    Done = 5,
    TimedOut = 6,
    ProviderError = 7,
    Cancelled = 8,
}

impl OperationState {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Done
                | OperationState::TimedOut
                | OperationState::ProviderError
                | OperationState::Cancelled
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => OperationState::Pending,
            1 => OperationState::Acquiring,
            2 => OperationState::Locked,
            3 => OperationState::Running,
            4 => OperationState::Released,
            5 => OperationState::Done,
            6 => OperationState::TimedOut,
            7 => OperationState::ProviderError,
            _ => OperationState::Cancelled,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Pending => "PENDING",
            OperationState::Acquiring => "ACQUIRING",
            OperationState::Locked => "LOCKED",
            OperationState::Running => "RUNNING",
            OperationState::Released => "RELEASED",
            OperationState::Done => "DONE",
            OperationState::TimedOut => "TIMED_OUT",
            OperationState::ProviderError => "PROVIDER_ERROR",
            OperationState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Shared, observable state of one operation.
#[derive(Debug, Clone)]
pub struct OperationTracker {
    resource: Arc<str>,
    state: Arc<AtomicU8>,
}

impl OperationTracker {
    pub(crate) fn new(resource: &str) -> Self {
        Self {
            resource: Arc::from(resource),
            state: Arc::new(AtomicU8::new(OperationState::Pending as u8)),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn state(&self) -> OperationState {
        OperationState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, next: OperationState) {
        let prev = OperationState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        trace!(resource = %self.resource, from = %prev, to = %next, "operation state");
    }

    /// Move from `from` to `to` only if the current state is `from`.
    pub(crate) fn transition(&self, from: OperationState, to: OperationState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            trace!(resource = %self.resource, from = %from, to = %to, "operation state");
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_only_from_expected_state() {
        let tracker = OperationTracker::new("doc:ws:a");
        assert_eq!(tracker.state(), OperationState::Pending);

        assert!(tracker.transition(OperationState::Pending, OperationState::Cancelled));
        assert!(!tracker.transition(OperationState::Pending, OperationState::Acquiring));
        assert_eq!(tracker.state(), OperationState::Cancelled);
        assert!(tracker.state().is_terminal());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(OperationState::TimedOut.to_string(), "TIMED_OUT");
        assert_eq!(OperationState::ProviderError.to_string(), "PROVIDER_ERROR");
    }
}

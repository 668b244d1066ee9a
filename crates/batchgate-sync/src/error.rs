//! Error types for the synchronization primitives.

use crate::lifecycle::LifecycleState;
use thiserror::Error;

/// A lifecycle transition was attempted from the wrong state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The transition is not valid from the current state.
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        /// The attempted transition.
        operation: &'static str,
        /// The state observed when the transition was refused.
        state: LifecycleState,
    },
}

/// Errors returned by [`Worker::schedule`](crate::Worker::schedule).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The worker has been stopped and accepts no more runs.
    #[error("worker is stopped")]
    Stopped,
}

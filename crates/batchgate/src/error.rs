//! Error types for batchgate operations.

use batchgate_sync::LifecycleError;
use std::collections::TryReserveError;
use thiserror::Error;

/// Errors from [`BatchQueue::create`](crate::BatchQueue::create).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CreateError {
    /// A setting is out of range.
    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),
}

/// Errors from [`BatchQueue::open`](crate::BatchQueue::open).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    /// The queue is already open (or opening/closing).
    #[error(transparent)]
    InvalidState(#[from] LifecycleError),

    /// The staging buffer's initial backing store could not be allocated.
    #[error("staging buffer allocation failed: {0}")]
    Staging(#[from] StagingError),
}

/// Errors from [`BatchQueue::enqueue`](crate::BatchQueue::enqueue).
///
/// On any error the item is dropped and its completion callback is never
/// invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// Caller misuse, e.g. a zero item size.
    #[error("invalid arguments: {0}")]
    InvalidArgs(&'static str),

    /// The queue is not open, is closing, or has faulted.
    #[error("queue is not accepting items")]
    InvalidState,

    /// The producer queue has no free slot.
    #[error("producer queue is full")]
    Full,
}

impl EnqueueError {
    /// Returns `true` if retrying the same call later may succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// Returns `true` if the queue will refuse every item until reopened.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidState)
    }
}

/// Errors from growing the staging buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StagingError {
    /// Item count or byte total would overflow the staging counters.
    #[error("staging capacity overflow")]
    CapacityOverflow,

    /// The allocator refused to grow the backing store.
    #[error(transparent)]
    Alloc(#[from] TryReserveError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_error_classes() {
        assert!(EnqueueError::Full.is_transient());
        assert!(!EnqueueError::Full.is_terminal());
        assert!(EnqueueError::InvalidState.is_terminal());
        assert!(!EnqueueError::InvalidArgs("size").is_transient());
        assert!(!EnqueueError::InvalidArgs("size").is_terminal());
    }
}

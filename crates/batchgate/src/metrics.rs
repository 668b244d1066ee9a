use crate::item::CompleteResult;
use std::sync::atomic::{AtomicU64, Ordering};

/// Queue counters, updated with relaxed atomics from producers, the worker
/// and completion callbacks.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Items accepted by `enqueue`.
    pub items_enqueued: AtomicU64,
    /// `enqueue` calls refused because the producer queue was full.
    pub items_rejected_full: AtomicU64,
    /// Batches accepted by the processor.
    pub batches_sent: AtomicU64,
    /// Items in accepted batches.
    pub items_sent: AtomicU64,
    /// Batches the processor handed back.
    pub batches_rejected: AtomicU64,
    /// Items completed with [`CompleteResult::Ok`].
    pub items_completed_ok: AtomicU64,
    /// Items completed with [`CompleteResult::Error`].
    pub items_completed_error: AtomicU64,
    /// Items completed with [`CompleteResult::Abandoned`].
    pub items_abandoned: AtomicU64,
    /// Times the queue entered the faulted state.
    pub faults: AtomicU64,
}

impl QueueMetrics {
    /// Items accepted by `enqueue`.
    pub fn items_enqueued(&self) -> u64 {
        self.items_enqueued.load(Ordering::Relaxed)
    }

    /// `enqueue` calls refused with a full producer queue.
    pub fn items_rejected_full(&self) -> u64 {
        self.items_rejected_full.load(Ordering::Relaxed)
    }

    /// Batches accepted by the processor.
    pub fn batches_sent(&self) -> u64 {
        self.batches_sent.load(Ordering::Relaxed)
    }

    /// Items in accepted batches.
    pub fn items_sent(&self) -> u64 {
        self.items_sent.load(Ordering::Relaxed)
    }

    /// Batches the processor handed back.
    pub fn batches_rejected(&self) -> u64 {
        self.batches_rejected.load(Ordering::Relaxed)
    }

    /// Items completed with [`CompleteResult::Ok`].
    pub fn items_completed_ok(&self) -> u64 {
        self.items_completed_ok.load(Ordering::Relaxed)
    }

    /// Items completed with [`CompleteResult::Error`].
    pub fn items_completed_error(&self) -> u64 {
        self.items_completed_error.load(Ordering::Relaxed)
    }

    /// Items completed with [`CompleteResult::Abandoned`].
    pub fn items_abandoned(&self) -> u64 {
        self.items_abandoned.load(Ordering::Relaxed)
    }

    /// Times the queue entered the faulted state.
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub(crate) fn record_enqueued(&self) {
        self.items_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_full(&self) {
        self.items_rejected_full.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, item_count: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.items_sent.fetch_add(item_count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, result: CompleteResult, item_count: usize) {
        let counter = match result {
            CompleteResult::Ok => &self.items_completed_ok,
            CompleteResult::Error => &self.items_completed_error,
            CompleteResult::Abandoned => &self.items_abandoned,
        };
        counter.fetch_add(item_count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies every counter into a plain value.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            items_rejected_full: self.items_rejected_full.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            items_sent: self.items_sent.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            items_completed_ok: self.items_completed_ok.load(Ordering::Relaxed),
            items_completed_error: self.items_completed_error.load(Ordering::Relaxed),
            items_abandoned: self.items_abandoned.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`QueueMetrics`].
///
/// Counters are read one by one, so a snapshot taken while the queue is busy
/// need not be mutually consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    pub items_enqueued: u64,
    pub items_rejected_full: u64,
    pub batches_sent: u64,
    pub items_sent: u64,
    pub batches_rejected: u64,
    pub items_completed_ok: u64,
    pub items_completed_error: u64,
    pub items_abandoned: u64,
    pub faults: u64,
}

impl MetricsSnapshot {
    /// Items that have received their completion callback.
    pub fn items_completed(&self) -> u64 {
        self.items_completed_ok + self.items_completed_error + self.items_abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_buckets() {
        let metrics = QueueMetrics::default();
        metrics.record_completed(CompleteResult::Ok, 3);
        metrics.record_completed(CompleteResult::Error, 2);
        metrics.record_completed(CompleteResult::Abandoned, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.items_completed_ok, 3);
        assert_eq!(snapshot.items_completed_error, 2);
        assert_eq!(snapshot.items_abandoned, 1);
        assert_eq!(snapshot.items_completed(), 6);
    }

    #[test]
    fn test_sent_counts_batches_and_items() {
        let metrics = QueueMetrics::default();
        metrics.record_sent(4);
        metrics.record_sent(1);
        assert_eq!(metrics.batches_sent(), 2);
        assert_eq!(metrics.snapshot().items_sent, 5);
    }

    #[test]
    fn test_accessors_match_snapshot() {
        let metrics = QueueMetrics::default();
        metrics.record_enqueued();
        metrics.record_full();
        metrics.record_sent(2);
        metrics.record_rejected();
        metrics.record_completed(CompleteResult::Abandoned, 1);
        metrics.record_fault();

        let snapshot = metrics.snapshot();
        assert_eq!(metrics.items_enqueued(), snapshot.items_enqueued);
        assert_eq!(metrics.items_rejected_full(), snapshot.items_rejected_full);
        assert_eq!(metrics.items_sent(), 2);
        assert_eq!(metrics.batches_rejected(), 1);
        assert_eq!(metrics.items_completed_ok(), 0);
        assert_eq!(metrics.items_completed_error(), 0);
        assert_eq!(metrics.items_abandoned(), 1);
        assert_eq!(metrics.faults(), 1);
    }
}

//! Admission policy: when a batch is cut and when the worker waits.
//!
//! Pure decisions over staging counters and settings, so the worker loop
//! holds no batching rules of its own. Three triggers end a batch:
//!
//! - **size**: the next item would push a non-empty batch past
//!   `max_batch_size`, so the current batch is flushed first.
//! - **count**: an idle worker finds at least `min_batch_size` bytes staged.
//! - **time**: the oldest staged item has waited `min_wait_time`.
//!
//! Flushing is additionally gated by `max_pending_requests` in-flight
//! batches.

use crate::settings::Settings;
use std::time::Duration;

/// What to do with a freshly dequeued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemDecision {
    /// Stage the item into the current batch.
    Append,
    /// Flush the staged items as a batch, then stage the item into a new one.
    FlushFirst,
}

/// What to do when the producer queue is empty and items are staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    /// Flush the staged items now.
    Flush,
    /// Arm the timer for the remaining wait, then stop.
    Wait(Duration),
}

/// Batching rules derived from [`Settings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    max_pending_requests: u32,
    max_batch_size: u64,
    min_batch_size: u64,
    min_wait: Duration,
}

impl AdmissionPolicy {
    /// Builds the policy for a queue.
    pub fn new(settings: &Settings) -> Self {
        Self {
            max_pending_requests: settings.max_pending_requests,
            max_batch_size: u64::from(settings.max_batch_size),
            min_batch_size: u64::from(settings.min_batch_size),
            min_wait: settings.min_wait(),
        }
    }

    /// Returns `true` if another batch may be put in flight.
    #[inline]
    pub fn has_capacity(&self, pending_batches: u32) -> bool {
        pending_batches < self.max_pending_requests
    }

    /// Decides whether an item of `size` bytes joins the staged batch.
    ///
    /// An empty staging buffer always accepts, so an item larger than
    /// `max_batch_size` travels alone instead of being refused.
    pub fn on_item(&self, staged_items: usize, staged_bytes: u64, size: u32) -> ItemDecision {
        if staged_items == 0 {
            return ItemDecision::Append;
        }
        let overflows = staged_items >= u32::MAX as usize;
        match staged_bytes.checked_add(u64::from(size)) {
            Some(total) if !overflows && total <= self.max_batch_size => ItemDecision::Append,
            _ => ItemDecision::FlushFirst,
        }
    }

    /// Decides between flushing and waiting once the producer queue is empty.
    ///
    /// `elapsed` is how long the oldest staged item has waited.
    pub fn on_idle(&self, staged_bytes: u64, elapsed: Duration) -> IdleDecision {
        if elapsed >= self.min_wait || staged_bytes >= self.min_batch_size {
            IdleDecision::Flush
        } else {
            IdleDecision::Wait(self.min_wait - elapsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_batch_size: u32, min_batch_size: u32, min_wait_time: u32) -> AdmissionPolicy {
        AdmissionPolicy::new(&Settings::new(2, max_batch_size, min_batch_size, min_wait_time))
    }

    #[test]
    fn test_capacity_gate() {
        let policy = policy(10, 10, 10);
        assert!(policy.has_capacity(0));
        assert!(policy.has_capacity(1));
        assert!(!policy.has_capacity(2));
        assert!(!policy.has_capacity(3));
    }

    #[test]
    fn test_size_trigger() {
        let policy = policy(3, 1000, 10);
        assert_eq!(policy.on_item(0, 0, 2), ItemDecision::Append);
        // 2 + 2 > 3
        assert_eq!(policy.on_item(1, 2, 2), ItemDecision::FlushFirst);
        // 2 + 1 fits exactly
        assert_eq!(policy.on_item(1, 2, 1), ItemDecision::Append);
    }

    #[test]
    fn test_oversized_item_travels_alone() {
        let policy = policy(3, 1000, 10);
        assert_eq!(policy.on_item(0, 0, 100), ItemDecision::Append);
        assert_eq!(policy.on_item(1, 100, 1), ItemDecision::FlushFirst);
    }

    #[test]
    fn test_counter_overflow_flushes_first() {
        let policy = policy(u32::MAX, 1000, 10);
        assert_eq!(
            policy.on_item(1, u64::MAX, 1),
            ItemDecision::FlushFirst
        );
        assert_eq!(
            policy.on_item(u32::MAX as usize, 1, 1),
            ItemDecision::FlushFirst
        );
    }

    #[test]
    fn test_time_trigger() {
        let policy = policy(u32::MAX, 1000, 10);
        assert_eq!(
            policy.on_idle(1, Duration::from_millis(4)),
            IdleDecision::Wait(Duration::from_millis(6))
        );
        assert_eq!(policy.on_idle(1, Duration::from_millis(10)), IdleDecision::Flush);
        assert_eq!(policy.on_idle(1, Duration::from_secs(1)), IdleDecision::Flush);
    }

    #[test]
    fn test_count_trigger() {
        let policy = policy(u32::MAX, 1, 10_000);
        assert_eq!(policy.on_idle(1, Duration::ZERO), IdleDecision::Flush);

        let policy = self::policy(u32::MAX, 64, 10_000);
        assert_eq!(policy.on_idle(64, Duration::ZERO), IdleDecision::Flush);
        assert!(matches!(
            policy.on_idle(63, Duration::ZERO),
            IdleDecision::Wait(_)
        ));
    }

    #[test]
    fn test_zero_wait_always_flushes() {
        let policy = policy(u32::MAX, u32::MAX, 0);
        assert_eq!(policy.on_idle(1, Duration::ZERO), IdleDecision::Flush);
    }
}

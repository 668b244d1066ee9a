use crate::error::CreateError;
use std::time::Duration;

/// Configuration for a [`BatchQueue`](crate::BatchQueue).
///
/// Immutable once the queue is created. All sizes are in bytes as declared
/// by the producer on `enqueue`; the queue never inspects item contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Settings {
    /// Cap on batches handed to the processor and not yet completed (≥ 1).
    pub max_pending_requests: u32,
    /// Byte budget per batch. An item that would push a non-empty batch past
    /// this budget starts the next batch instead.
    pub max_batch_size: u32,
    /// Staged bytes at which an idle worker flushes without waiting.
    pub min_batch_size: u32,
    /// Milliseconds the oldest staged item may wait before a flush is forced.
    pub min_wait_time: u32,
    /// Slots in the producer queue. A full producer queue rejects `enqueue`.
    pub queue_capacity: u32,
}

impl Settings {
    /// Creates settings with the default producer queue capacity.
    pub const fn new(
        max_pending_requests: u32,
        max_batch_size: u32,
        min_batch_size: u32,
        min_wait_time: u32,
    ) -> Self {
        Self {
            max_pending_requests,
            max_batch_size,
            min_batch_size,
            min_wait_time,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Small batches flushed almost immediately.
    pub const fn low_latency() -> Self {
        Self::new(8, 64 * 1024, 1, 1)
    }

    /// Large batches, longer waits, fewer in-flight requests.
    pub const fn high_throughput() -> Self {
        Self {
            max_pending_requests: 4,
            max_batch_size: 4 * 1024 * 1024,
            min_batch_size: 1024 * 1024,
            min_wait_time: 10,
            queue_capacity: 1 << 18,
        }
    }

    /// Sets the in-flight batch limit.
    pub fn with_max_pending_requests(mut self, max_pending_requests: u32) -> Self {
        self.max_pending_requests = max_pending_requests;
        self
    }

    /// Sets the per-batch byte budget.
    pub fn with_max_batch_size(mut self, max_batch_size: u32) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Sets the early-flush byte threshold.
    pub fn with_min_batch_size(mut self, min_batch_size: u32) -> Self {
        self.min_batch_size = min_batch_size;
        self
    }

    /// Sets the forced-flush wait in milliseconds.
    pub fn with_min_wait_time(mut self, min_wait_time: u32) -> Self {
        self.min_wait_time = min_wait_time;
        self
    }

    /// Sets the producer queue capacity.
    pub fn with_queue_capacity(mut self, queue_capacity: u32) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Returns `min_wait_time` as a [`Duration`].
    #[inline]
    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(u64::from(self.min_wait_time))
    }

    /// Checks the settings a queue cannot run without.
    pub fn validate(&self) -> Result<(), CreateError> {
        if self.max_pending_requests == 0 {
            return Err(CreateError::InvalidSettings(
                "max_pending_requests must be nonzero",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(CreateError::InvalidSettings("queue_capacity must be nonzero"));
        }
        Ok(())
    }
}

/// 64K producer queue slots.
pub const DEFAULT_QUEUE_CAPACITY: u32 = 1 << 16;

impl Default for Settings {
    fn default() -> Self {
        Self::new(4, 1024 * 1024, 64 * 1024, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Settings::default().validate().is_ok());
        assert!(Settings::low_latency().validate().is_ok());
        assert!(Settings::high_throughput().validate().is_ok());
    }

    #[test]
    fn test_zero_pending_rejected() {
        let settings = Settings::default().with_max_pending_requests(0);
        assert!(matches!(
            settings.validate(),
            Err(CreateError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let settings = Settings::default().with_queue_capacity(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_min_wait_duration() {
        let settings = Settings::new(1, 10, 10, 250);
        assert_eq!(settings.min_wait(), Duration::from_millis(250));
        assert_eq!(settings.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }
}

//! Staging buffer: items dequeued by the worker but not yet batched.
//!
//! Owned by the worker loop alone, so it carries no synchronization of its
//! own. Growth is explicit and fallible: `push` first ensures capacity with
//! amortized doubling through `Vec::try_reserve_exact`, and an allocation
//! failure is returned to the caller (together with the item) instead of
//! aborting.

use crate::error::StagingError;
use crate::item::Item;
use std::time::Instant;

/// Smallest backing store allocated on first growth.
const MIN_CAPACITY: usize = 16;

/// Upper bound on staged items; the count must fit the `u32` batch length.
const MAX_ITEMS: usize = u32::MAX as usize;

pub(crate) struct StagingBuffer<T, R> {
    items: Vec<Item<T, R>>,
    total_size: u64,
    #[cfg(test)]
    item_limit: Option<usize>,
}

impl<T, R> StagingBuffer<T, R> {
    /// Creates an empty buffer without allocating.
    pub(crate) fn new() -> Self {
        Self {
            items: Vec::new(),
            total_size: 0,
            #[cfg(test)]
            item_limit: None,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of the declared sizes of all staged items.
    #[inline]
    pub(crate) fn total_size(&self) -> u64 {
        self.total_size
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Enqueue time of the item that has waited longest.
    #[inline]
    pub(crate) fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.items.first().map(|item| item.enqueued_at)
    }

    /// Returns `false` if staging one more item of `size` bytes would
    /// overflow the item count or the byte total.
    #[inline]
    pub(crate) fn can_hold(&self, size: u32) -> bool {
        self.items.len() < self.max_items()
            && self.total_size.checked_add(u64::from(size)).is_some()
    }

    /// Makes room for `additional` more items, doubling the backing store.
    pub(crate) fn ensure_capacity(&mut self, additional: usize) -> Result<(), StagingError> {
        let required = self
            .items
            .len()
            .checked_add(additional)
            .filter(|&required| required <= MAX_ITEMS)
            .ok_or(StagingError::CapacityOverflow)?;
        if required <= self.items.capacity() {
            return Ok(());
        }

        let target = (self.items.capacity().saturating_mul(2))
            .max(required)
            .max(MIN_CAPACITY)
            .min(MAX_ITEMS);
        self.items.try_reserve_exact(target - self.items.len())?;
        Ok(())
    }

    /// Appends an item, handing it back if the buffer cannot grow.
    pub(crate) fn push(&mut self, item: Item<T, R>) -> Result<(), (StagingError, Item<T, R>)> {
        if !self.can_hold(item.size) {
            return Err((StagingError::CapacityOverflow, item));
        }
        if let Err(e) = self.ensure_capacity(1) {
            return Err((e, item));
        }
        self.total_size += u64::from(item.size);
        self.items.push(item);
        Ok(())
    }

    /// Moves all staged items out in staging order and resets the counters.
    ///
    /// The backing store is kept for the next batch.
    pub(crate) fn take(&mut self) -> Vec<Item<T, R>> {
        self.total_size = 0;
        self.items.drain(..).collect()
    }

    /// Drops the backing store. Used when the queue closes.
    pub(crate) fn release(&mut self) -> Vec<Item<T, R>> {
        self.total_size = 0;
        std::mem::take(&mut self.items)
    }

    #[cfg(not(test))]
    #[inline]
    fn max_items(&self) -> usize {
        MAX_ITEMS
    }

    #[cfg(test)]
    fn max_items(&self) -> usize {
        self.item_limit.unwrap_or(MAX_ITEMS)
    }

    /// Caps the buffer at `limit` items so growth failure can be exercised.
    #[cfg(test)]
    pub(crate) fn set_item_limit(&mut self, limit: usize) {
        self.item_limit = Some(limit);
    }

    /// Recomputes the byte total from the staged items.
    pub(crate) fn recount(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.size)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::CompleteResult;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(u32, CompleteResult)>>>;

    fn item(id: u32, size: u32, log: &Log) -> Item<u32, ()> {
        let log = Arc::clone(log);
        Item::new(
            id,
            size,
            Box::new(move |result, _| log.lock().unwrap().push((id, result))),
        )
    }

    #[test]
    fn test_push_tracks_size_and_order() {
        let log = Log::default();
        let mut staging = StagingBuffer::new();
        assert!(staging.is_empty());
        assert_eq!(staging.capacity(), 0);

        for id in 0..5 {
            staging.push(item(id, id + 1, &log)).unwrap();
        }
        assert_eq!(staging.len(), 5);
        assert_eq!(staging.total_size(), 1 + 2 + 3 + 4 + 5);
        assert_eq!(staging.recount(), staging.total_size());

        let items = staging.take();
        let ids: Vec<u32> = items.iter().map(|item| item.data).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(staging.is_empty());
        assert_eq!(staging.total_size(), 0);
    }

    #[test]
    fn test_take_keeps_backing_store() {
        let log = Log::default();
        let mut staging = StagingBuffer::new();
        staging.push(item(0, 1, &log)).unwrap();
        let capacity = staging.capacity();
        assert!(capacity >= MIN_CAPACITY);

        drop(staging.take());
        assert_eq!(staging.capacity(), capacity);

        drop(staging.release());
        assert_eq!(staging.capacity(), 0);
    }

    #[test]
    fn test_growth_doubles() {
        let log = Log::default();
        let mut staging = StagingBuffer::new();
        for id in 0..=MIN_CAPACITY as u32 {
            staging.push(item(id, 1, &log)).unwrap();
        }
        assert!(staging.capacity() >= 2 * MIN_CAPACITY);
    }

    #[test]
    fn test_ensure_capacity_overflow_is_reported() {
        let mut staging: StagingBuffer<u32, ()> = StagingBuffer::new();
        assert_eq!(
            staging.ensure_capacity(usize::MAX),
            Err(StagingError::CapacityOverflow)
        );
        assert_eq!(
            staging.ensure_capacity(MAX_ITEMS + 1),
            Err(StagingError::CapacityOverflow)
        );
        assert_eq!(staging.capacity(), 0);
    }

    #[test]
    fn test_push_past_item_limit_returns_item() {
        let log = Log::default();
        let mut staging = StagingBuffer::new();
        staging.set_item_limit(1);
        staging.push(item(0, 1, &log)).unwrap();

        let (error, rejected) = staging.push(item(1, 1, &log)).unwrap_err();
        assert_eq!(error, StagingError::CapacityOverflow);
        assert_eq!(rejected.data, 1);
        assert_eq!(staging.len(), 1);
        assert_eq!(staging.total_size(), 1);
    }

    #[test]
    fn test_oldest_is_first_staged() {
        let log = Log::default();
        let mut staging = StagingBuffer::new();
        assert!(staging.oldest_enqueued_at().is_none());

        let first = item(0, 1, &log);
        let first_at = first.enqueued_at;
        staging.push(first).unwrap();
        staging.push(item(1, 1, &log)).unwrap();
        assert_eq!(staging.oldest_enqueued_at(), Some(first_at));
    }

    #[test]
    fn test_released_items_can_be_completed() {
        let log = Log::default();
        let mut staging = StagingBuffer::new();
        staging.push(item(7, 3, &log)).unwrap();
        staging.push(item(8, 3, &log)).unwrap();

        for item in staging.release() {
            item.complete(CompleteResult::Abandoned, None);
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec![(7, CompleteResult::Abandoned), (8, CompleteResult::Abandoned)]
        );
    }
}

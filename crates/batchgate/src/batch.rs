//! Batches and the processor contract.
//!
//! A [`Batch`] is created at flush time and owns its items until the
//! processor settles it with [`Batch::complete`]. Completion fans out to
//! every item's callback in dequeue order, then releases the batch's slot in
//! the in-flight limit and the execution permit taken for the flush.
//!
//! Ownership is strictly linear: staging buffer → `Batch` → completion. A
//! processor that rejects a batch hands it back inside [`Rejected`], so the
//! queue can still deliver a result to every item.

use crate::item::{CompleteResult, Item};
use batchgate_sync::ExecPermit;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Monotonically increasing batch identifier. Never reused within a queue.
pub type BatchId = u64;

/// Receives batches from a [`BatchQueue`](crate::BatchQueue).
///
/// `process` is called synchronously from the queue's worker and should not
/// block. Returning `Ok(())` transfers ownership of the batch: the processor
/// must eventually call [`Batch::complete`] exactly once, from any thread.
/// Returning `Err` hands the batch back untouched; the queue then completes
/// every item itself (abandoned for [`RejectReason::NotOpen`], failed
/// otherwise) and faults.
pub trait BatchProcessor<T>: Send + Sync + 'static {
    /// Opaque result passed to every item's completion callback.
    type Output: Send + 'static;

    /// Accepts or rejects a batch.
    fn process(&self, batch: Batch<T, Self::Output>) -> Result<(), Rejected<T, Self::Output>>;
}

/// Shared processors: lets callers keep a handle to the processor they give
/// the queue.
impl<T, P> BatchProcessor<T> for Arc<P>
where
    P: BatchProcessor<T>,
{
    type Output = P::Output;

    fn process(&self, batch: Batch<T, Self::Output>) -> Result<(), Rejected<T, Self::Output>> {
        P::process(self, batch)
    }
}

/// Why a processor refused a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RejectReason {
    /// The processor is shutting down. Items are abandoned, not failed, but
    /// the queue still faults.
    #[error("processor is not open")]
    NotOpen,
    /// The processor considered the batch malformed.
    #[error("processor rejected batch arguments")]
    InvalidArgs,
    /// Any other processor failure.
    #[error("processor failed to accept batch")]
    Error,
}

impl RejectReason {
    /// Result delivered to each item of a rejected batch.
    #[inline]
    pub fn item_result(self) -> CompleteResult {
        match self {
            Self::NotOpen => CompleteResult::Abandoned,
            Self::InvalidArgs | Self::Error => CompleteResult::Error,
        }
    }
}

/// A batch handed back by [`BatchProcessor::process`].
pub struct Rejected<T, R> {
    /// Why the batch was refused.
    pub reason: RejectReason,
    /// The untouched batch.
    pub batch: Batch<T, R>,
}

impl<T, R> Rejected<T, R> {
    /// Wraps a refused batch.
    pub fn new(reason: RejectReason, batch: Batch<T, R>) -> Self {
        Self { reason, batch }
    }
}

impl<T, R> fmt::Debug for Rejected<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .field("batch", &self.batch)
            .finish()
    }
}

/// Bookkeeping hooks a batch calls back into when it is settled.
pub(crate) trait BatchLedger: Send + Sync {
    /// The batch no longer counts against the in-flight limit.
    fn release_pending(&self, batch_id: BatchId, result: CompleteResult, item_count: usize);

    /// Capacity was freed; give waiting items a chance to proceed.
    fn capacity_available(&self);
}

/// Everything a batch must hand back when it is settled.
struct Settlement {
    permit: ExecPermit,
    ledger: Arc<dyn BatchLedger>,
}

/// An ordered set of items submitted to the processor as one unit.
pub struct Batch<T, R> {
    id: BatchId,
    items: Vec<Item<T, R>>,
    total_size: u64,
    settlement: Option<Settlement>,
}

impl<T, R> Batch<T, R> {
    pub(crate) fn new(
        id: BatchId,
        items: Vec<Item<T, R>>,
        total_size: u64,
        permit: ExecPermit,
        ledger: Arc<dyn BatchLedger>,
    ) -> Self {
        Self {
            id,
            items,
            total_size,
            settlement: Some(Settlement { permit, ledger }),
        }
    }

    /// Batch identifier, strictly increasing in flush order.
    #[inline]
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Number of items.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the batch holds no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of the items' declared sizes.
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Item data in dequeue order.
    pub fn items(&self) -> impl ExactSizeIterator<Item = &T> + '_ {
        self.items.iter().map(|item| &item.data)
    }

    /// Item data with declared sizes, in dequeue order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&T, u32)> + '_ {
        self.items.iter().map(|item| (&item.data, item.size))
    }

    /// Settles the batch: every item's callback receives `result` and a
    /// reference to `output`, in dequeue order.
    ///
    /// Consumes the batch, so completion happens exactly once.
    pub fn complete(self, result: CompleteResult, output: Option<R>) {
        self.settle(result, output.as_ref(), true);
    }

    /// Completes a batch the processor refused. Does not wake the worker:
    /// the queue faults right after.
    pub(crate) fn settle_rejected(self, result: CompleteResult) {
        self.settle(result, None, false);
    }

    fn settle(mut self, result: CompleteResult, output: Option<&R>, wake_worker: bool) {
        let Some(Settlement { permit, ledger }) = self.settlement.take() else {
            return;
        };

        let items = std::mem::take(&mut self.items);
        let item_count = items.len();
        for item in items {
            item.complete(result, output);
        }

        ledger.release_pending(self.id, result, item_count);
        drop(permit);
        if wake_worker {
            ledger.capacity_available();
        }
    }
}

impl<T, R> Drop for Batch<T, R> {
    fn drop(&mut self) {
        if self.settlement.is_some() {
            // The processor accepted this batch and dropped it without
            // completing: items, in-flight slot and permit would all leak.
            tracing::error!(
                batch_id = self.id,
                items = self.items.len(),
                "batch dropped without completion; aborting"
            );
            std::process::abort();
        }
    }
}

impl<T, R> fmt::Debug for Batch<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("len", &self.items.len())
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

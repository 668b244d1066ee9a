//! The single-consumer worker pass and batch flushing.
//!
//! A pass runs inside [`Worker`](batchgate_sync::Worker), which never runs it
//! concurrently with itself. Each iteration holds an execution permit, so a
//! closing queue stops the pass at the next iteration boundary.

use crate::batch::{Batch, BatchLedger, BatchProcessor, Rejected};
use crate::invariants::{
    debug_assert_batch_id_increasing, debug_assert_pending_bounded,
    debug_assert_staging_consistent,
};
use crate::item::{CompleteResult, Item};
use crate::policy::{IdleDecision, ItemDecision};
use crate::queue::{Shared, WorkerState};
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Why a flush did not reach the processor or was refused by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushFailure {
    /// The queue started closing or faulted before the flush.
    Refused,
    /// The processor handed the batch back.
    Rejected,
}

type State<T, P> = WorkerState<T, <P as BatchProcessor<T>>::Output>;

impl<T, P> Shared<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    /// One worker pass: drain the producer queue into staging and flush
    /// whatever the admission policy says is ready.
    pub(crate) fn run_worker(self: &Arc<Self>) {
        let mut state = self.lock_state();

        {
            let Some(_permit) = self.lifecycle.try_enter() else {
                return;
            };
            // This pass supersedes any wait armed by the previous one.
            self.timer.cancel();
        }

        loop {
            let Some(_permit) = self.lifecycle.try_enter() else {
                break;
            };

            let pending = self.pending_batches.load(Ordering::Acquire);
            if !self.policy.has_capacity(pending) {
                tracing::trace!(pending, "in-flight limit reached; waiting for completions");
                break;
            }

            let step = match self.queue.pop() {
                Some(item) => self.stage(&mut state, item),
                None => self.on_queue_empty(&mut state),
            };
            if step.is_break() {
                break;
            }
        }

        self.publish_staged(&state.staging);
    }

    fn stage(self: &Arc<Self>, state: &mut State<T, P>, item: Item<T, P::Output>) -> ControlFlow<()> {
        let decision = self
            .policy
            .on_item(state.staging.len(), state.staging.total_size(), item.size);
        if decision == ItemDecision::FlushFirst {
            if let Err(failure) = self.flush(state) {
                tracing::debug!(?failure, "flush failed; ending worker pass");
                // Keep the item staged; close abandons it.
                self.push_staged(state, item);
                return ControlFlow::Break(());
            }
        }

        if self.push_staged(state, item) {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }

    fn on_queue_empty(self: &Arc<Self>, state: &mut State<T, P>) -> ControlFlow<()> {
        if state.staging.is_empty() {
            return ControlFlow::Break(());
        }

        let elapsed = state
            .staging
            .oldest_enqueued_at()
            .map_or(Duration::ZERO, |at| at.elapsed());
        match self.policy.on_idle(state.staging.total_size(), elapsed) {
            IdleDecision::Flush => {
                if let Err(failure) = self.flush(state) {
                    tracing::debug!(?failure, "flush failed; ending worker pass");
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
            IdleDecision::Wait(delay) => {
                tracing::trace!(?delay, staged = state.staging.len(), "arming wait deadline");
                self.timer.start(delay);
                ControlFlow::Break(())
            }
        }
    }

    /// Stages an item. A staging buffer that cannot grow faults the queue and
    /// fails the item.
    fn push_staged(&self, state: &mut State<T, P>, item: Item<T, P::Output>) -> bool {
        match state.staging.push(item) {
            Ok(()) => true,
            Err((error, item)) => {
                tracing::warn!(%error, staged = state.staging.len(), "staging buffer cannot grow");
                item.complete(CompleteResult::Error, None);
                self.metrics.record_completed(CompleteResult::Error, 1);
                self.fault();
                false
            }
        }
    }

    /// Moves the staged items into a batch and offers it to the processor.
    pub(crate) fn flush(self: &Arc<Self>, state: &mut State<T, P>) -> Result<(), FlushFailure> {
        debug_assert_staging_consistent!(state.staging);

        // Held by the batch until it completes.
        let Some(permit) = self.lifecycle.try_enter() else {
            return Err(FlushFailure::Refused);
        };

        let pending = self.pending_batches.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert_pending_bounded!(pending, self.settings.max_pending_requests);

        let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        debug_assert_batch_id_increasing!(state.last_batch_id, batch_id);
        state.last_batch_id = Some(batch_id);

        let total_size = state.staging.total_size();
        let items = state.staging.take();
        let item_count = items.len();

        let ledger: Arc<dyn BatchLedger> = Arc::clone(self) as Arc<dyn BatchLedger>;
        let batch = Batch::new(batch_id, items, total_size, permit, ledger);

        match self.processor.process(batch) {
            Ok(()) => {
                self.metrics.record_sent(item_count);
                tracing::debug!(batch_id, items = item_count, bytes = total_size, pending, "batch sent");
                Ok(())
            }
            Err(Rejected { reason, batch }) => {
                self.metrics.record_rejected();
                tracing::warn!(batch_id, %reason, items = item_count, "processor rejected batch");
                batch.settle_rejected(reason.item_result());
                self.fault();
                Err(FlushFailure::Rejected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Batch, BatchProcessor, BatchQueue, CompleteResult, EnqueueError, Rejected, Settings,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::runtime::Handle;

    struct Accepting;

    impl BatchProcessor<u32> for Accepting {
        type Output = ();

        fn process(&self, batch: Batch<u32, ()>) -> Result<(), Rejected<u32, ()>> {
            batch.complete(CompleteResult::Ok, None);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_staging_growth_failure_faults_queue() {
        let faults = Arc::new(AtomicUsize::new(0));
        let fault_count = Arc::clone(&faults);
        // Neither trigger fires, so everything dequeued stays staged.
        let queue = BatchQueue::create(
            Settings::new(4, 1 << 20, 1000, 60_000),
            Accepting,
            move || {
                fault_count.fetch_add(1, Ordering::SeqCst);
            },
            Handle::current(),
        )
        .unwrap();
        queue.open().unwrap();
        queue.shared.lock_state().staging.set_item_limit(2);

        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3u32 {
            let log = Arc::clone(&log);
            queue
                .enqueue(id, 1, move |result, _| log.lock().unwrap().push((id, result)))
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while log.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "timed out waiting for the fault");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(*log.lock().unwrap(), vec![(2, CompleteResult::Error)]);
        assert!(queue.is_faulted());
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.enqueue(3, 1, |_, _| {}),
            Err(EnqueueError::InvalidState)
        );
        let metrics = queue.metrics();
        assert_eq!(metrics.faults, 1);
        assert_eq!(metrics.items_completed_error, 1);
        assert_eq!(metrics.batches_sent, 0);

        tokio::task::block_in_place(|| queue.close());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (2, CompleteResult::Error),
                (0, CompleteResult::Abandoned),
                (1, CompleteResult::Abandoned),
            ]
        );
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }
}

//! The batch queue: lifecycle, enqueue and shutdown.

use crate::batch::{BatchId, BatchLedger, BatchProcessor};
use crate::error::{CreateError, EnqueueError, OpenError};
use crate::invariants::debug_assert_pending_released;
use crate::item::{CompleteResult, Item};
use crate::metrics::{MetricsSnapshot, QueueMetrics};
use crate::policy::AdmissionPolicy;
use crate::settings::Settings;
use crate::staging::StagingBuffer;
use batchgate_sync::{Lifecycle, LifecycleState, Timer, Worker};
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;

/// Items the staging buffer reserves when the queue opens.
const INITIAL_STAGING_CAPACITY: usize = 16;

type FaultFn = Box<dyn Fn() + Send + Sync>;

/// Accumulates items from many producers into size- and time-bounded batches
/// and hands them to a [`BatchProcessor`].
///
/// Producers call [`enqueue`](Self::enqueue) from any thread. A single
/// coalesced worker, running on the tokio runtime given to
/// [`create`](Self::create), drains the producer queue into a staging buffer
/// and flushes batches when the [`AdmissionPolicy`] says so, with at most
/// `max_pending_requests` batches in flight.
///
/// Every accepted item receives exactly one completion callback: the
/// processor's result, or [`CompleteResult::Abandoned`] if the queue closes
/// first.
///
/// # Blocking
///
/// [`close`](Self::close) (and therefore `drop`) blocks until in-flight
/// batches complete and the worker is idle. It must not be called from a
/// completion callback or from inside [`BatchProcessor::process`], and on a
/// current-thread runtime it must not be called from the runtime's own
/// thread.
///
/// # Example
///
/// ```
/// use batchgate::{Batch, BatchProcessor, BatchQueue, CompleteResult, Rejected, Settings};
/// use std::sync::mpsc;
///
/// struct Sum;
///
/// impl BatchProcessor<u64> for Sum {
///     type Output = u64;
///
///     fn process(&self, batch: Batch<u64, u64>) -> Result<(), Rejected<u64, u64>> {
///         let total = batch.items().sum();
///         batch.complete(CompleteResult::Ok, Some(total));
///         Ok(())
///     }
/// }
///
/// let runtime = tokio::runtime::Runtime::new().unwrap();
/// let settings = Settings::new(2, 1024, 1, 5);
/// let queue = BatchQueue::create(settings, Sum, || {}, runtime.handle().clone()).unwrap();
/// queue.open().unwrap();
///
/// let (tx, rx) = mpsc::channel();
/// queue
///     .enqueue(40, 8, move |result, total| {
///         tx.send((result, total.copied())).unwrap();
///     })
///     .unwrap();
///
/// let (result, total) = rx.recv().unwrap();
/// assert_eq!(result, CompleteResult::Ok);
/// assert_eq!(total, Some(40));
/// queue.close();
/// ```
pub struct BatchQueue<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    pub(crate) shared: Arc<Shared<T, P>>,
}

/// Worker-owned state. The mutex is uncontended while the queue is open:
/// only the worker pass and `open`/`close` take it.
pub(crate) struct WorkerState<T, R> {
    pub(crate) staging: StagingBuffer<T, R>,
    pub(crate) last_batch_id: Option<BatchId>,
}

pub(crate) struct Shared<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    pub(crate) settings: Settings,
    pub(crate) policy: AdmissionPolicy,
    pub(crate) processor: P,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) queue: ArrayQueue<Item<T, P::Output>>,
    pub(crate) pending_batches: CachePadded<AtomicU32>,
    pub(crate) next_batch_id: CachePadded<AtomicU64>,
    pub(crate) state: Mutex<WorkerState<T, P::Output>>,
    pub(crate) staged_items: AtomicU64,
    pub(crate) staged_bytes: AtomicU64,
    pub(crate) worker: Worker,
    pub(crate) timer: Timer,
    pub(crate) metrics: QueueMetrics,
    on_fault: FaultFn,
    fault_reported: AtomicBool,
}

impl<T, P> BatchQueue<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    /// Creates a queue in the `Created` state.
    ///
    /// `on_fault` is invoked the first time the queue faults, and never again
    /// for this queue, even across close and re-open. The worker and timer run
    /// on `runtime`.
    pub fn create<F>(
        settings: Settings,
        processor: P,
        on_fault: F,
        runtime: Handle,
    ) -> Result<Self, CreateError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        settings.validate()?;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared<T, P>>| {
            let weak = weak.clone();
            let worker = Worker::new(runtime.clone(), move || {
                if let Some(shared) = weak.upgrade() {
                    shared.run_worker();
                }
            });

            let deadline_worker = worker.clone();
            let timer = Timer::new(runtime, move || {
                if let Err(error) = deadline_worker.schedule() {
                    tracing::debug!(%error, "wait deadline reached after worker stopped");
                }
            });

            Shared {
                settings,
                policy: AdmissionPolicy::new(&settings),
                processor,
                lifecycle: Arc::new(Lifecycle::new()),
                queue: ArrayQueue::new(settings.queue_capacity as usize),
                pending_batches: CachePadded::new(AtomicU32::new(0)),
                next_batch_id: CachePadded::new(AtomicU64::new(0)),
                state: Mutex::new(WorkerState {
                    staging: StagingBuffer::new(),
                    last_batch_id: None,
                }),
                staged_items: AtomicU64::new(0),
                staged_bytes: AtomicU64::new(0),
                worker,
                timer,
                metrics: QueueMetrics::default(),
                on_fault: Box::new(on_fault),
                fault_reported: AtomicBool::new(false),
            }
        });

        tracing::debug!(?settings, "batch queue created");
        Ok(Self { shared })
    }

    /// Opens the queue for `enqueue`.
    ///
    /// Succeeds from `Created` or `Closed`. On failure the queue stays where
    /// it was.
    pub fn open(&self) -> Result<(), OpenError> {
        let shared = &self.shared;
        shared.lifecycle.begin_open()?;

        if let Err(error) = shared
            .lock_state()
            .staging
            .ensure_capacity(INITIAL_STAGING_CAPACITY)
        {
            shared.lifecycle.end_open(false);
            return Err(error.into());
        }

        shared.timer.cancel();
        shared.worker.start();
        shared.lifecycle.end_open(true);

        tracing::info!(
            max_pending_requests = shared.settings.max_pending_requests,
            max_batch_size = shared.settings.max_batch_size,
            "batch queue opened"
        );
        Ok(())
    }

    /// Closes the queue.
    ///
    /// Refuses new items, waits for in-flight batches to complete, stops the
    /// worker, then completes every item still staged or queued with
    /// [`CompleteResult::Abandoned`]. A no-op unless the queue is open.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.lifecycle.begin_close().is_err() {
            return;
        }

        shared.timer.cancel();
        shared.worker.stop();

        let mut abandoned = 0usize;
        {
            let mut state = shared.lock_state();
            for item in state.staging.release() {
                item.complete(CompleteResult::Abandoned, None);
                abandoned += 1;
            }
            while let Some(item) = shared.queue.pop() {
                item.complete(CompleteResult::Abandoned, None);
                abandoned += 1;
            }
            shared.publish_staged(&state.staging);
        }
        shared
            .metrics
            .record_completed(CompleteResult::Abandoned, abandoned);

        if let Err(error) = shared.lifecycle.end_close() {
            tracing::warn!(%error, "lifecycle did not finish closing");
        }
        tracing::info!(abandoned, "batch queue closed");
    }

    /// Submits an item of `size` bytes.
    ///
    /// On `Ok`, `on_complete` is called exactly once, from whichever thread
    /// settles the item. On `Err` the item is dropped and `on_complete` is
    /// never called.
    pub fn enqueue<F>(&self, item: T, size: u32, on_complete: F) -> Result<(), EnqueueError>
    where
        F: FnOnce(CompleteResult, Option<&P::Output>) + Send + 'static,
    {
        if size == 0 {
            return Err(EnqueueError::InvalidArgs("item size must be nonzero"));
        }

        let shared = &self.shared;
        let Some(_permit) = shared.lifecycle.try_enter() else {
            return Err(EnqueueError::InvalidState);
        };

        let item = Item::new(item, size, Box::new(on_complete));
        if shared.queue.push(item).is_err() {
            shared.metrics.record_full();
            return Err(EnqueueError::Full);
        }
        shared.metrics.record_enqueued();
        tracing::trace!(size, "item enqueued");

        if let Err(error) = shared.worker.schedule() {
            tracing::debug!(%error, "worker not scheduled after enqueue");
        }
        Ok(())
    }

    /// The settings the queue was created with.
    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    /// Returns `true` once the queue has faulted, until it is closed.
    pub fn is_faulted(&self) -> bool {
        self.shared.lifecycle.is_faulted()
    }

    /// Batches handed to the processor and not yet completed.
    pub fn pending_batches(&self) -> u32 {
        self.shared.pending_batches.load(Ordering::Acquire)
    }

    /// Items in the staging buffer as of the last worker pass.
    pub fn staged_items(&self) -> u64 {
        self.shared.staged_items.load(Ordering::Relaxed)
    }

    /// Bytes in the staging buffer as of the last worker pass.
    pub fn staged_bytes(&self) -> u64 {
        self.shared.staged_bytes.load(Ordering::Relaxed)
    }

    /// Items waiting in the producer queue.
    pub fn queued_items(&self) -> usize {
        self.shared.queue.len()
    }

    /// Snapshot of the queue's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl<T, P> Drop for BatchQueue<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    fn drop(&mut self) {
        self.close();
    }
}

impl<T, P> fmt::Debug for BatchQueue<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchQueue")
            .field("settings", &self.shared.settings)
            .field("lifecycle", &self.shared.lifecycle)
            .field("pending_batches", &self.pending_batches())
            .field("queued_items", &self.queued_items())
            .finish_non_exhaustive()
    }
}

impl<T, P> Shared<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, WorkerState<T, P::Output>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mirrors the staging counters for readers outside the worker.
    pub(crate) fn publish_staged(&self, staging: &StagingBuffer<T, P::Output>) {
        self.staged_items
            .store(staging.len() as u64, Ordering::Relaxed);
        self.staged_bytes
            .store(staging.total_size(), Ordering::Relaxed);
    }

    /// Faults the queue. The fault callback runs for the first fault of this
    /// queue only.
    pub(crate) fn fault(&self) {
        if !self.lifecycle.fault() {
            return;
        }
        self.metrics.record_fault();
        tracing::warn!("batch queue faulted; refusing items until closed");
        if !self.fault_reported.swap(true, Ordering::AcqRel) {
            (self.on_fault)();
        }
    }
}

impl<T, P> BatchLedger for Shared<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    fn release_pending(&self, batch_id: BatchId, result: CompleteResult, item_count: usize) {
        let previous = self.pending_batches.fetch_sub(1, Ordering::AcqRel);
        debug_assert_pending_released!(previous);
        self.metrics.record_completed(result, item_count);
        tracing::debug!(batch_id, ?result, items = item_count, "batch completed");
    }

    fn capacity_available(&self) {
        if let Err(error) = self.worker.schedule() {
            tracing::debug!(%error, "worker not rescheduled after completion");
        }
    }
}

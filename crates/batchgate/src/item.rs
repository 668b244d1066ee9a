use std::fmt;
use std::time::Instant;

/// Outcome delivered to each item's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompleteResult {
    /// The processor handled the batch containing the item.
    Ok,
    /// The item was never processed because the queue or processor shut down.
    Abandoned,
    /// The processor failed the batch, or the queue faulted.
    Error,
}

/// Per-item completion callback.
///
/// Receives the batch-level result and the processor's output, which is
/// `None` whenever the item never reached a processor completion
/// (abandonment, rejection).
pub type CompletionFn<R> = Box<dyn FnOnce(CompleteResult, Option<&R>) + Send>;

/// A submitted item, owned by the queue until its callback has run.
pub(crate) struct Item<T, R> {
    pub(crate) data: T,
    pub(crate) size: u32,
    pub(crate) enqueued_at: Instant,
    on_complete: CompletionFn<R>,
}

impl<T, R> Item<T, R> {
    pub(crate) fn new(data: T, size: u32, on_complete: CompletionFn<R>) -> Self {
        Self {
            data,
            size,
            enqueued_at: Instant::now(),
            on_complete,
        }
    }

    /// Runs the completion callback and releases the item.
    pub(crate) fn complete(self, result: CompleteResult, output: Option<&R>) {
        (self.on_complete)(result, output);
    }
}

impl<T, R> fmt::Debug for Item<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("size", &self.size)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

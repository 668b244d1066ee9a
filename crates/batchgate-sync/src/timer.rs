use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

type Callback = Box<dyn Fn() + Send + Sync>;

/// Single-shot delayed callback, cancelable and restartable.
///
/// At most one shot is armed at a time: [`start`](Self::start) replaces any
/// armed shot. A shot that already woke up but has not yet run the callback
/// is suppressed by `cancel`/`start` through a generation check.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    runtime: Handle,
    callback: Callback,
    armed: Mutex<Option<AbortHandle>>,
    generation: AtomicU64,
}

impl Timer {
    /// Creates an unarmed timer that invokes `callback` on `runtime`.
    pub fn new<F>(runtime: Handle, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(TimerInner {
                runtime,
                callback: Box::new(callback),
                armed: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Arms the timer to fire once after `delay`, replacing any armed shot.
    pub fn start(&self, delay: Duration) {
        let mut armed = self.inner.lock_armed();
        if let Some(previous) = armed.take() {
            previous.abort();
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let inner = Arc::clone(&self.inner);
        let task = self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(generation);
        });
        *armed = Some(task.abort_handle());
    }

    /// Disarms the timer. No-op if nothing is armed.
    pub fn cancel(&self) {
        let mut armed = self.inner.lock_armed();
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(previous) = armed.take() {
            previous.abort();
        }
    }

    /// Returns `true` if a shot is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.inner.lock_armed().is_some()
    }
}

impl TimerInner {
    fn lock_armed(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, generation: u64) {
        {
            let mut armed = self.lock_armed();
            if self.generation.load(Ordering::Acquire) != generation {
                return;
            }
            armed.take();
        }
        (self.callback)();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("armed", &self.is_armed())
            .finish()
    }
}

use crate::error::WorkerError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tokio::runtime::Handle;

// Run-state transitions:
//
//   schedule: IDLE -> SCHEDULED (spawns a task)
//             RUNNING -> RESCHEDULED
//             SCHEDULED | RESCHEDULED -> unchanged (absorbed)
//   task:     SCHEDULED -> RUNNING, run job,
//             RUNNING -> IDLE, or RESCHEDULED -> RUNNING and run again
//   dropped:  SCHEDULED -> IDLE (the runtime shut down before the task ran)
const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const RESCHEDULED: u8 = 3;

type Job = Box<dyn Fn() + Send + Sync>;

/// Coalesced job scheduler.
///
/// The job never runs concurrently with itself, but a run may happen on any
/// runtime thread. Scheduling while a run is in progress guarantees exactly
/// one further run after it; any number of extra requests are absorbed.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    run_state: AtomicU8,
    stopped: AtomicBool,
    job: Job,
    runtime: Handle,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl Worker {
    /// Creates a worker that runs `job` on `runtime`.
    pub fn new<F>(runtime: Handle, job: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(WorkerInner {
                run_state: AtomicU8::new(IDLE),
                stopped: AtomicBool::new(false),
                job: Box::new(job),
                runtime,
                idle_lock: Mutex::new(()),
                idle: Condvar::new(),
            }),
        }
    }

    /// Requests a run of the job.
    pub fn schedule(&self) -> Result<(), WorkerError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(WorkerError::Stopped);
        }

        let mut current = self.inner.run_state.load(Ordering::Acquire);
        loop {
            // Absorbed requests still write, so the run that absorbs them
            // acquires everything the requester did before scheduling.
            let next = match current {
                IDLE => SCHEDULED,
                RUNNING => RESCHEDULED,
                other => other,
            };
            match self.inner.run_state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == IDLE {
            let run = ScheduledRun {
                inner: Some(Arc::clone(&self.inner)),
            };
            self.inner.runtime.spawn(async move { run.execute() });
        }
        Ok(())
    }

    /// Refuses further scheduling and waits for an in-progress run to finish.
    ///
    /// Must not be called from inside the job.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);

        let mut guard = self
            .inner
            .idle_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while self.inner.run_state.load(Ordering::Acquire) != IDLE {
            guard = self
                .inner
                .idle
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Re-enables scheduling after [`stop`](Self::stop).
    pub fn start(&self) {
        self.inner.stopped.store(false, Ordering::Release);
    }

    /// Returns `true` if the worker has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Returns `true` if a run is scheduled or in progress.
    pub fn is_busy(&self) -> bool {
        self.inner.run_state.load(Ordering::Acquire) != IDLE
    }
}

impl WorkerInner {
    fn run(&self) {
        self.run_state.swap(RUNNING, Ordering::AcqRel);

        loop {
            if !self.stopped.load(Ordering::Acquire)
                && panic::catch_unwind(AssertUnwindSafe(|| (self.job)())).is_err()
            {
                tracing::error!("worker job panicked");
            }

            match self.run_state.compare_exchange(
                RUNNING,
                IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(_) => {
                    // RESCHEDULED: exactly one more pass.
                    self.run_state.swap(RUNNING, Ordering::AcqRel);
                }
            }
        }

        self.notify_idle();
    }

    fn notify_idle(&self) {
        let _guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.idle.notify_all();
    }
}

/// A spawned run. If the runtime drops the task before it is polled, the
/// worker is returned to idle so `stop` does not wait forever.
struct ScheduledRun {
    inner: Option<Arc<WorkerInner>>,
}

impl ScheduledRun {
    fn execute(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.run();
        }
    }
}

impl Drop for ScheduledRun {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        // Only this run can move the state out of SCHEDULED.
        if inner
            .run_state
            .compare_exchange(SCHEDULED, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("scheduled worker run dropped before it started");
            inner.notify_idle();
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("run_state", &self.inner.run_state.load(Ordering::Relaxed))
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_schedule_runs_job() {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = {
            let runs = Arc::clone(&runs);
            Worker::new(Handle::current(), move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };

        worker.schedule().unwrap();
        while worker.is_busy() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_schedule_while_running_coalesces() {
        let runs = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let worker = {
            let runs = Arc::clone(&runs);
            let concurrent = Arc::clone(&concurrent);
            let max_concurrent = Arc::clone(&max_concurrent);
            Worker::new(Handle::current(), move || {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                runs.fetch_add(1, Ordering::SeqCst);
                concurrent.fetch_sub(1, Ordering::SeqCst);
            })
        };

        worker.schedule().unwrap();
        // Wait for the first run to start, then pile on requests.
        while concurrent.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for _ in 0..10 {
            worker.schedule().unwrap();
        }

        while worker.is_busy() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_refuses_and_start_resumes() {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = {
            let runs = Arc::clone(&runs);
            Worker::new(Handle::current(), move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };

        worker.stop();
        assert!(worker.is_stopped());
        assert_eq!(worker.schedule(), Err(WorkerError::Stopped));

        worker.start();
        worker.schedule().unwrap();
        while worker.is_busy() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_job_panic_leaves_worker_usable() {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = {
            let runs = Arc::clone(&runs);
            Worker::new(Handle::current(), move || {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            })
        };

        worker.schedule().unwrap();
        while worker.is_busy() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        worker.schedule().unwrap();
        while worker.is_busy() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_dropped_with_runtime_returns_to_idle() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = {
            let runs = Arc::clone(&runs);
            Worker::new(runtime.handle().clone(), move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };

        // A current-thread runtime never polls the task until blocked on.
        worker.schedule().unwrap();
        assert!(worker.is_busy());

        drop(runtime);
        assert!(!worker.is_busy());
        worker.stop();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}

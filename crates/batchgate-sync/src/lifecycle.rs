use crate::error::LifecycleError;
use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

// =============================================================================
// STATE WORD LAYOUT
// =============================================================================
//
// The whole lifecycle lives in one AtomicU64 so that entering an execution
// region is a single CAS against both the state and the fault flag:
//
//   bits  0..32  number of outstanding execution permits
//   bits 32..35  LifecycleState discriminant
//   bit  35      faulted flag
//
// ## Close/drain handshake
//
// `begin_close` flips Opened -> Closing with a CAS, which makes every later
// `try_enter` fail. It then waits on `drained` until the permit count is zero.
// A permit drop decrements first and only then, if it observed Closing with
// a count going 1 -> 0, takes `drain_lock` and notifies. The closer re-reads
// the count under `drain_lock`, so a decrement that happens between the
// closer's check and its wait cannot be lost.
//
// =============================================================================

const COUNT_MASK: u64 = (1 << 32) - 1;
const STATE_SHIFT: u32 = 32;
const STATE_MASK: u64 = 0b111 << STATE_SHIFT;
const FAULT_BIT: u64 = 1 << 35;

/// Coarse lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Constructed, never opened (or a failed open rolled back).
    Created,
    /// `begin_open` succeeded, `end_open` not yet called.
    Opening,
    /// Accepting execution regions.
    Opened,
    /// `begin_close` in progress; new regions are refused.
    Closing,
    /// Fully closed. May be opened again.
    Closed,
}

impl LifecycleState {
    #[inline]
    const fn bits(self) -> u64 {
        let discriminant = match self {
            Self::Created => 0,
            Self::Opening => 1,
            Self::Opened => 2,
            Self::Closing => 3,
            Self::Closed => 4,
        };
        discriminant << STATE_SHIFT
    }

    #[inline]
    const fn from_word(word: u64) -> Self {
        match (word & STATE_MASK) >> STATE_SHIFT {
            0 => Self::Created,
            1 => Self::Opening,
            2 => Self::Opened,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[inline]
const fn count_of(word: u64) -> u64 {
    word & COUNT_MASK
}

/// Open/close/fault state machine with counted execution regions.
///
/// Shared state that may be torn down by `close` must only be touched while
/// holding an [`ExecPermit`]. `begin_close` refuses new permits immediately
/// and blocks until all outstanding permits are dropped, after which the
/// caller has exclusive access until `end_close`.
///
/// A fault is sticky until the next `end_close`: it refuses new permits but
/// lets outstanding ones finish normally.
pub struct Lifecycle {
    word: CachePadded<AtomicU64>,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl Lifecycle {
    /// Creates a lifecycle in the `Created` state.
    pub fn new() -> Self {
        Self {
            word: CachePadded::new(AtomicU64::new(LifecycleState::Created.bits())),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    /// Returns the current coarse state.
    #[inline]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_word(self.word.load(Ordering::Acquire))
    }

    /// Returns `true` if [`fault`](Self::fault) was called since the last open.
    #[inline]
    pub fn is_faulted(&self) -> bool {
        self.word.load(Ordering::Acquire) & FAULT_BIT != 0
    }

    /// Returns the number of outstanding execution permits.
    #[inline]
    pub fn exec_count(&self) -> u64 {
        count_of(self.word.load(Ordering::Acquire))
    }

    /// `Created | Closed -> Opening`. Clears any fault left from a previous run.
    pub fn begin_open(&self) -> Result<(), LifecycleError> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let state = LifecycleState::from_word(current);
            if !matches!(state, LifecycleState::Created | LifecycleState::Closed) {
                return Err(LifecycleError::InvalidState {
                    operation: "open",
                    state,
                });
            }
            debug_assert_eq!(count_of(current), 0, "permits outstanding outside Opened");
            match self.word.compare_exchange_weak(
                current,
                LifecycleState::Opening.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// `Opening -> Opened` on success, `Opening -> Created` otherwise.
    pub fn end_open(&self, success: bool) {
        let target = if success {
            LifecycleState::Opened
        } else {
            LifecycleState::Created
        };
        let previous = self.word.swap(target.bits(), Ordering::AcqRel);
        debug_assert_eq!(
            LifecycleState::from_word(previous),
            LifecycleState::Opening,
            "end_open without begin_open"
        );
    }

    /// Enters an execution region.
    ///
    /// Returns `None` unless the lifecycle is `Opened` and not faulted. The
    /// region is exited when the returned permit is dropped.
    pub fn try_enter(self: &Arc<Self>) -> Option<ExecPermit> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if LifecycleState::from_word(current) != LifecycleState::Opened
                || current & FAULT_BIT != 0
                || count_of(current) == COUNT_MASK
            {
                return None;
            }
            match self.word.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ExecPermit {
                        lifecycle: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn exit(&self) {
        let previous = self.word.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(count_of(previous) > 0, "execution permit count underflow");

        if count_of(previous) == 1 && LifecycleState::from_word(previous) == LifecycleState::Closing {
            let _guard = self.drain_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.drained.notify_all();
        }
    }

    /// `Opened -> Closing`, then blocks until every outstanding permit is dropped.
    ///
    /// Fails if the lifecycle is not `Opened`, which makes a repeated close a
    /// no-op for the caller. Must not be called while holding a permit.
    pub fn begin_close(&self) -> Result<(), LifecycleError> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let state = LifecycleState::from_word(current);
            if state != LifecycleState::Opened {
                return Err(LifecycleError::InvalidState {
                    operation: "close",
                    state,
                });
            }
            let next = (current & !STATE_MASK) | LifecycleState::Closing.bits();
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let mut guard = self.drain_lock.lock().unwrap_or_else(PoisonError::into_inner);
        while count_of(self.word.load(Ordering::Acquire)) != 0 {
            guard = self
                .drained
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    /// `Closing -> Closed`. Clears the fault flag.
    pub fn end_close(&self) -> Result<(), LifecycleError> {
        let current = self.word.load(Ordering::Acquire);
        let state = LifecycleState::from_word(current);
        if state != LifecycleState::Closing {
            return Err(LifecycleError::InvalidState {
                operation: "end close",
                state,
            });
        }
        debug_assert_eq!(count_of(current), 0, "end_close with permits outstanding");
        self.word
            .store(LifecycleState::Closed.bits(), Ordering::Release);
        Ok(())
    }

    /// Marks the lifecycle as faulted.
    ///
    /// Returns `true` only for the call that set the flag.
    pub fn fault(&self) -> bool {
        self.word.fetch_or(FAULT_BIT, Ordering::AcqRel) & FAULT_BIT == 0
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.word.load(Ordering::Acquire);
        f.debug_struct("Lifecycle")
            .field("state", &LifecycleState::from_word(word))
            .field("faulted", &(word & FAULT_BIT != 0))
            .field("exec_count", &count_of(word))
            .finish()
    }
}

/// An entered execution region. Dropping it exits the region.
///
/// Permits are owned (`'static`), so one can be moved to another thread and
/// released there, e.g. when an asynchronous operation completes.
#[must_use = "dropping the permit exits the execution region immediately"]
pub struct ExecPermit {
    lifecycle: Arc<Lifecycle>,
}

impl fmt::Debug for ExecPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecPermit").finish_non_exhaustive()
    }
}

impl Drop for ExecPermit {
    fn drop(&mut self) {
        self.lifecycle.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn opened() -> Arc<Lifecycle> {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.begin_open().unwrap();
        lifecycle.end_open(true);
        lifecycle
    }

    #[test]
    fn test_enter_refused_before_open() {
        let lifecycle = Arc::new(Lifecycle::new());
        assert_eq!(lifecycle.state(), LifecycleState::Created);
        assert!(lifecycle.try_enter().is_none());
    }

    #[test]
    fn test_failed_open_rolls_back() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.begin_open().unwrap();
        assert!(lifecycle.try_enter().is_none());
        lifecycle.end_open(false);
        assert_eq!(lifecycle.state(), LifecycleState::Created);
        assert!(lifecycle.begin_open().is_ok());
    }

    #[test]
    fn test_permits_are_counted() {
        let lifecycle = opened();
        let a = lifecycle.try_enter().unwrap();
        let b = lifecycle.try_enter().unwrap();
        assert_eq!(lifecycle.exec_count(), 2);
        drop(a);
        assert_eq!(lifecycle.exec_count(), 1);
        drop(b);
        assert_eq!(lifecycle.exec_count(), 0);
    }

    #[test]
    fn test_double_open_refused() {
        let lifecycle = opened();
        assert!(matches!(
            lifecycle.begin_open(),
            Err(LifecycleError::InvalidState {
                state: LifecycleState::Opened,
                ..
            })
        ));
    }

    #[test]
    fn test_fault_is_sticky_and_reported_once() {
        let lifecycle = opened();
        let permit = lifecycle.try_enter().unwrap();

        assert!(lifecycle.fault());
        assert!(!lifecycle.fault());
        assert!(lifecycle.is_faulted());
        assert!(lifecycle.try_enter().is_none());

        // Outstanding permits still exit normally.
        drop(permit);
        assert_eq!(lifecycle.exec_count(), 0);
    }

    #[test]
    fn test_close_is_one_shot() {
        let lifecycle = opened();
        assert!(lifecycle.begin_close().is_ok());
        assert!(lifecycle.begin_close().is_err());
        assert!(lifecycle.end_close().is_ok());
        assert!(lifecycle.begin_close().is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Closed);
    }

    #[test]
    fn test_close_clears_fault_and_allows_reopen() {
        let lifecycle = opened();
        lifecycle.fault();
        lifecycle.begin_close().unwrap();
        lifecycle.end_close().unwrap();
        assert!(!lifecycle.is_faulted());

        lifecycle.begin_open().unwrap();
        lifecycle.end_open(true);
        assert!(lifecycle.try_enter().is_some());
    }

    #[test]
    fn test_close_waits_for_outstanding_permit() {
        let lifecycle = opened();
        let permit = lifecycle.try_enter().unwrap();

        let closer = {
            let lifecycle = Arc::clone(&lifecycle);
            thread::spawn(move || {
                lifecycle.begin_close().unwrap();
                lifecycle.exec_count()
            })
        };

        // Give the closer time to start waiting.
        while lifecycle.state() != LifecycleState::Closing {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!closer.is_finished());
        assert!(lifecycle.try_enter().is_none());

        drop(permit);
        assert_eq!(closer.join().unwrap(), 0);
    }
}

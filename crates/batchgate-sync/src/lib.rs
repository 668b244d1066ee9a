//! Synchronization primitives underneath the batchgate pipeline.
//!
//! Three independent building blocks, each usable on its own:
//!
//! - [`Lifecycle`]: an open/close/fault state machine with counted execution
//!   regions. Holding an [`ExecPermit`] keeps `close` from completing, so
//!   teardown never races in-flight work.
//! - [`Worker`]: a coalesced job scheduler. At most one run of the job is in
//!   progress at any time; scheduling while running arranges exactly one more
//!   run, and extra requests are absorbed.
//! - [`Timer`]: a single-shot delayed callback that can be cancelled and
//!   restarted.
//!
//! `Worker` and `Timer` execute on a caller-supplied tokio runtime handle.
//!
//! # Example
//!
//! ```
//! use batchgate_sync::Lifecycle;
//! use std::sync::Arc;
//!
//! let lifecycle = Arc::new(Lifecycle::new());
//! lifecycle.begin_open().unwrap();
//! lifecycle.end_open(true);
//!
//! let permit = lifecycle.try_enter().expect("opened");
//! drop(permit);
//!
//! lifecycle.begin_close().unwrap();
//! assert!(lifecycle.try_enter().is_none());
//! lifecycle.end_close().unwrap();
//! ```

mod error;
mod lifecycle;
mod timer;
mod worker;

pub use error::{LifecycleError, WorkerError};
pub use lifecycle::{ExecPermit, Lifecycle, LifecycleState};
pub use timer::Timer;
pub use worker::Worker;

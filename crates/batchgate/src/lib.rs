//! Batchgate - Batching Admission Pipeline
//!
//! Many producer threads submit small sized items; a single consumer groups
//! them into batches and hands each batch to a downstream [`BatchProcessor`]
//! with asynchronous completion.
//!
//! # Key Features
//!
//! - Lock-free multi-producer ingestion (bounded `ArrayQueue`)
//! - Size, count and time batching triggers ([`AdmissionPolicy`])
//! - In-flight batch limit with backpressure
//! - Exactly one completion callback per accepted item, including
//!   [`CompleteResult::Abandoned`] on shutdown
//! - Terminal fault state on processor rejection, reported once through a
//!   fault callback
//!
//! # Lifecycle
//!
//! `create` → `open` → `enqueue`* → `close`. A closed queue may be opened
//! again. Dropping a queue closes it.
//!
//! See [`BatchQueue`] for a complete example.

mod batch;
mod error;
mod invariants;
mod item;
mod metrics;
mod policy;
mod queue;
mod settings;
mod staging;
mod worker_loop;

pub use batch::{Batch, BatchId, BatchProcessor, RejectReason, Rejected};
pub use batchgate_sync::LifecycleState;
pub use error::{CreateError, EnqueueError, OpenError, StagingError};
pub use item::{CompleteResult, CompletionFn};
pub use metrics::{MetricsSnapshot, QueueMetrics};
pub use policy::{AdmissionPolicy, IdleDecision, ItemDecision};
pub use queue::BatchQueue;
pub use settings::{Settings, DEFAULT_QUEUE_CAPACITY};

//! End-to-end demo: producer threads feed a queue whose processor "writes"
//! each batch asynchronously, then the queue is closed and its counters are
//! printed as JSON.
//!
//! Run with: RUST_LOG=batchgate=debug cargo run -p batchgate --example demo --features serde

use anyhow::Context;
use batchgate::{Batch, BatchProcessor, BatchQueue, CompleteResult, Rejected, Settings};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const PRODUCERS: u64 = 4;
const RECORDS_PER_PRODUCER: u64 = 2_500;

/// A log record awaiting a durable write.
#[derive(Debug)]
struct Record {
    producer: u64,
    seq: u64,
}

/// Simulates a storage device: one write per batch, with latency.
struct SlowDevice {
    bytes_written: Arc<AtomicU64>,
}

impl BatchProcessor<Record> for SlowDevice {
    /// Device offset the batch landed at.
    type Output = u64;

    fn process(&self, batch: Batch<Record, u64>) -> Result<(), Rejected<Record, u64>> {
        let bytes_written = Arc::clone(&self.bytes_written);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let offset = bytes_written.fetch_add(batch.total_size(), Ordering::Relaxed);
            tracing::debug!(
                batch_id = batch.id(),
                records = batch.len(),
                first = ?batch.items().next().map(|r| (r.producer, r.seq)),
                offset,
                "batch written"
            );
            batch.complete(CompleteResult::Ok, Some(offset));
        });
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = tokio::runtime::Runtime::new().context("building runtime")?;
    let bytes_written = Arc::new(AtomicU64::new(0));
    let settings = Settings::new(4, 256 * 1024, 64 * 1024, 5);
    tracing::info!(settings = %serde_json::to_string(&settings)?, "starting demo");

    let queue = Arc::new(BatchQueue::create(
        settings,
        SlowDevice {
            bytes_written: Arc::clone(&bytes_written),
        },
        || tracing::error!("device faulted"),
        runtime.handle().clone(),
    )?);
    queue.open()?;

    let durable = Arc::new(AtomicU64::new(0));
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            let durable = Arc::clone(&durable);
            thread::spawn(move || -> anyhow::Result<()> {
                let mut rng = rand::thread_rng();
                for seq in 0..RECORDS_PER_PRODUCER {
                    let size = rng.gen_range(64..4096);
                    let durable = Arc::clone(&durable);
                    queue.enqueue(Record { producer, seq }, size, move |result, _offset| {
                        if result == CompleteResult::Ok {
                            durable.fetch_add(1, Ordering::Relaxed);
                        }
                    })?;
                    if seq % 500 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                Ok(())
            })
        })
        .collect();

    for producer in producers {
        producer
            .join()
            .map_err(|_| anyhow::anyhow!("producer panicked"))??;
    }

    let expected = PRODUCERS * RECORDS_PER_PRODUCER;
    while durable.load(Ordering::Relaxed) < expected {
        thread::sleep(Duration::from_millis(5));
    }
    queue.close();

    let metrics = queue.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    tracing::info!(
        records = durable.load(Ordering::Relaxed),
        bytes = bytes_written.load(Ordering::Relaxed),
        batches = metrics.batches_sent,
        "demo finished"
    );
    Ok(())
}

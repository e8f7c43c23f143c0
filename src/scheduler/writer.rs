//! Batch writer that drains persistence work off the tick path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db::{Persistence, RecordData, StoredSample};

/// Flush once this many operations are buffered.
const FLUSH_THRESHOLD: usize = 500;

/// Flush at least this often.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Capacity of the queue between the scheduler and the writer.
pub const QUEUE_CAPACITY: usize = 1000;

/// A unit of persistence work.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    Sample(StoredSample),
    Record { host: String, record: RecordData },
}

/// Spawn the batch writer, returning the queue sender and the task handle.
pub fn spawn_batch_writer(persistence: Arc<dyn Persistence>) -> (mpsc::Sender<PersistOp>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let handle = tokio::spawn(run_batch_writer(rx, persistence));
    (tx, handle)
}

/// Accumulate operations and flush them in batches until the queue closes.
pub async fn run_batch_writer(mut rx: mpsc::Receiver<PersistOp>, persistence: Arc<dyn Persistence>) {
    let mut buffer: Vec<PersistOp> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            op = rx.recv() => {
                match op {
                    Some(op) => {
                        buffer.push(op);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush_buffer(persistence.as_ref(), &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(persistence.as_ref(), &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(persistence.as_ref(), &mut buffer);
            }
        }
    }
}

fn flush_buffer(persistence: &dyn Persistence, buffer: &mut Vec<PersistOp>) {
    if buffer.is_empty() {
        return;
    }

    let mut samples = Vec::new();
    for op in buffer.drain(..) {
        match op {
            PersistOp::Sample(sample) => samples.push(sample),
            PersistOp::Record { host, record } => {
                if let Err(e) = persistence.update_record(&host, &record) {
                    tracing::error!("Failed to persist record for {}: {}", host, e);
                }
            }
        }
    }

    if let Err(e) = persistence.insert_samples(&samples) {
        tracing::error!("Failed to flush {} samples: {}", samples.len(), e);
    }
}

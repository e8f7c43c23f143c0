//! Retention manager for cleaning up old samples.

use crate::db::Persistence;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Manager for deleting samples older than the coarse graph span.
///
/// Runs on its own interval, independent of the probe tick.
pub struct RetentionManager {
    persistence: Arc<dyn Persistence>,
    retention: Duration,
    interval: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(persistence: Arc<dyn Persistence>, retention: Duration, interval: Duration) -> Self {
        Self {
            persistence,
            retention,
            interval,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let persistence = self.persistence.clone();
        let retention = self.retention;
        let period = self.interval;
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let cutoff = Utc::now().timestamp_millis() - retention.as_millis() as i64;
                        process_retention(persistence.as_ref(), cutoff);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Delete everything older than `cutoff`. Failures are logged, never raised.
pub fn process_retention(persistence: &dyn Persistence, cutoff: i64) -> usize {
    match persistence.delete_older_than(cutoff) {
        Ok(deleted) => {
            if deleted > 0 {
                tracing::info!("RetentionManager: Deleted {} samples older than {}", deleted, cutoff);
            }
            deleted
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to delete old samples: {}", e);
            0
        }
    }
}

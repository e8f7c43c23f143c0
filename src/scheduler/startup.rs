//! One-time rehydration of the in-memory store from persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::RosterEntry;
use crate::db::{DbError, Persistence, RecordData, StoredSample, Timestamp};
use crate::series::{SeriesError, TimeSeriesStore};

/// How many times the initial history query is attempted.
pub const STARTUP_ATTEMPTS: u32 = 5;

/// Delay before the first retry; doubles after each failure.
pub const STARTUP_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("history unavailable after {attempts} attempts: {source}")]
    Rehydrate {
        attempts: u32,
        #[source]
        source: DbError,
    },
    #[error("persistence error: {0}")]
    Persistence(#[from] DbError),
    #[error(transparent)]
    Series(#[from] SeriesError),
}

/// What rehydration loaded, for the startup log line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RehydrateSummary {
    pub samples: usize,
    pub records_loaded: usize,
    pub records_derived: usize,
    pub records_reconciled: usize,
}

/// Load records and the coarse history for every roster entry.
///
/// Order matters: persisted records (or legacy-derived ones, which are
/// persisted immediately) go in first, then the loaded history may only
/// raise them.
pub async fn rehydrate(
    persistence: Arc<dyn Persistence>,
    store: &TimeSeriesStore,
    roster: &[RosterEntry],
    graph_duration: Duration,
    now: Timestamp,
    backoff: Duration,
) -> Result<RehydrateSummary, StartupError> {
    let start = now - graph_duration.as_millis() as i64;
    let samples = query_with_backoff(persistence.as_ref(), start, now, backoff).await?;

    let mut summary = RehydrateSummary {
        samples: samples.len(),
        ..Default::default()
    };

    for entry in roster {
        let key = entry.host_key();
        match persistence.get_record(&key)? {
            Some(record) => {
                store.promote_record(entry.id, record)?;
                summary.records_loaded += 1;
            }
            None => {
                if let Some(record) = persistence.derive_legacy_record(&key)? {
                    persistence.upsert_record_if_absent(&key, &record)?;
                    store.promote_record(entry.id, record)?;
                    summary.records_derived += 1;
                    tracing::info!(
                        "Derived record for {} from stored samples: {} players",
                        entry.label,
                        record.player_count
                    );
                }
            }
        }
    }

    let mut by_host: HashMap<&str, (Vec<Timestamp>, Vec<Option<u32>>)> = HashMap::new();
    let mut axis: Vec<Timestamp> = Vec::with_capacity(samples.len());
    for StoredSample { timestamp, host, player_count } in &samples {
        let series = by_host.entry(host.as_str()).or_default();
        series.0.push(*timestamp);
        series.1.push(*player_count);
        axis.push(*timestamp);
    }
    axis.sort_unstable();
    axis.dedup();
    store.load_shared_axis(start, now, &axis);

    // Every host is loaded, even without history, so each window spans the axis.
    for entry in roster {
        let key = entry.host_key();
        let (timestamps, counts) = by_host
            .get(key.as_str())
            .map(|(t, c)| (t.as_slice(), c.as_slice()))
            .unwrap_or_default();
        if let Some(record) = store.load_historical(entry.id, start, now, timestamps, counts)? {
            persist_reconciled(persistence.as_ref(), &key, &record)?;
            summary.records_reconciled += 1;
        }
    }

    Ok(summary)
}

fn persist_reconciled(persistence: &dyn Persistence, key: &str, record: &RecordData) -> Result<(), DbError> {
    if !persistence.upsert_record_if_absent(key, record)? {
        persistence.update_record(key, record)?;
    }
    Ok(())
}

async fn query_with_backoff(
    persistence: &dyn Persistence,
    start: Timestamp,
    end: Timestamp,
    backoff: Duration,
) -> Result<Vec<StoredSample>, StartupError> {
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match persistence.query_range(None, start, end) {
            Ok(samples) => return Ok(samples),
            Err(e) if attempt >= STARTUP_ATTEMPTS => {
                return Err(StartupError::Rehydrate {
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => {
                tracing::warn!(
                    "Loading history failed (attempt {}/{}): {}; retrying in {:?}",
                    attempt,
                    STARTUP_ATTEMPTS,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::series::{WindowBounds, WindowSettings};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::NamedTempFile;

    fn settings() -> WindowSettings {
        WindowSettings {
            coarse: WindowBounds::new(100, None),
            fine: WindowBounds::new(100, None),
            graph_sample_interval_ms: 0,
        }
    }

    fn roster() -> Arc<[RosterEntry]> {
        vec![
            RosterEntry::new(0, "C", "c.example.org", 25565),
            RosterEntry::new(1, "D", "d.example.org", 25565),
        ]
        .into()
    }

    fn stored(timestamp: Timestamp, host: &str, player_count: Option<u32>) -> StoredSample {
        StoredSample {
            timestamp,
            host: host.to_string(),
            player_count,
        }
    }

    #[tokio::test]
    async fn test_rehydrate_derives_and_persists_missing_record() {
        let tmp = NamedTempFile::new().unwrap();
        let db = Arc::new(Store::new(tmp.path()).unwrap());
        db.insert_samples(&[
            stored(50, "c.example.org:25565", Some(7)),
            stored(100, "c.example.org:25565", Some(42)),
            stored(150, "c.example.org:25565", None),
            stored(100, "d.example.org:25565", Some(1)),
        ])
        .unwrap();
        db.upsert_record_if_absent("d.example.org:25565", &RecordData::new(80, 5)).unwrap();

        let roster = roster();
        let store = TimeSeriesStore::new(roster.clone(), settings());
        let summary = rehydrate(db.clone(), &store, &roster, Duration::from_millis(1_000), 200, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(summary.samples, 4);
        assert_eq!(summary.records_derived, 1);
        assert_eq!(summary.records_loaded, 1);
        assert_eq!(store.record(0).unwrap(), Some(RecordData::new(42, 100)));
        assert_eq!(db.get_record("c.example.org:25565").unwrap(), Some(RecordData::new(42, 100)));
        assert_eq!(store.record(1).unwrap(), Some(RecordData::new(80, 5)));
        assert_eq!(store.coarse_window(0).unwrap().timestamps, vec![50, 100, 150]);
        assert_eq!(store.shared_axis().coarse, vec![50, 100, 150]);
    }

    #[tokio::test]
    async fn test_rehydrate_raises_stale_persisted_record() {
        let tmp = NamedTempFile::new().unwrap();
        let db = Arc::new(Store::new(tmp.path()).unwrap());
        db.upsert_record_if_absent("c.example.org:25565", &RecordData::new(3, 1)).unwrap();
        db.insert_samples(&[stored(100, "c.example.org:25565", Some(9))]).unwrap();

        let roster = roster();
        let store = TimeSeriesStore::new(roster.clone(), settings());
        let summary = rehydrate(db.clone(), &store, &roster, Duration::from_millis(1_000), 200, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(summary.records_reconciled, 1);
        assert_eq!(store.record(0).unwrap(), Some(RecordData::new(9, 100)));
        assert_eq!(db.get_record("c.example.org:25565").unwrap(), Some(RecordData::new(9, 100)));
    }

    #[tokio::test]
    async fn test_rehydrate_aligns_every_host_to_the_shared_axis() {
        let tmp = NamedTempFile::new().unwrap();
        let db = Arc::new(Store::new(tmp.path()).unwrap());
        let mut samples = Vec::new();
        for t in [0, 30, 60, 90] {
            samples.push(stored(t, "c.example.org:25565", Some(t as u32)));
        }
        // D joined the roster one tick later.
        for t in [30, 60, 90] {
            samples.push(stored(t, "d.example.org:25565", Some(1)));
        }
        db.insert_samples(&samples).unwrap();

        let roster: Arc<[RosterEntry]> = vec![
            RosterEntry::new(0, "C", "c.example.org", 25565),
            RosterEntry::new(1, "D", "d.example.org", 25565),
            RosterEntry::new(2, "E", "e.example.org", 25565),
        ]
        .into();
        let per_minute = WindowSettings {
            graph_sample_interval_ms: 60,
            ..settings()
        };
        let store = TimeSeriesStore::new(roster.clone(), per_minute);
        rehydrate(db.clone(), &store, &roster, Duration::from_millis(1_000), 100, Duration::ZERO)
            .await
            .unwrap();

        let axis = store.shared_axis().coarse;
        assert_eq!(axis, vec![0, 60]);
        for entry in roster.iter() {
            assert_eq!(store.coarse_window(entry.id).unwrap().timestamps, axis);
        }
        assert_eq!(store.coarse_window(1).unwrap().counts, vec![None, Some(1)]);
        assert_eq!(store.coarse_window(2).unwrap().counts, vec![None, None]);
        assert_eq!(store.record(0).unwrap(), Some(RecordData::new(90, 90)));
    }

    /// Fails every history query; everything else is a no-op.
    struct Unreachable {
        calls: AtomicU32,
    }

    impl Persistence for Unreachable {
        fn insert_samples(&self, _: &[StoredSample]) -> Result<(), DbError> {
            Ok(())
        }
        fn query_range(&self, _: Option<&str>, _: Timestamp, _: Timestamp) -> Result<Vec<StoredSample>, DbError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DbError::Migration("database is locked".to_string()))
        }
        fn get_record(&self, _: &str) -> Result<Option<RecordData>, DbError> {
            Ok(None)
        }
        fn upsert_record_if_absent(&self, _: &str, _: &RecordData) -> Result<bool, DbError> {
            Ok(true)
        }
        fn update_record(&self, _: &str, _: &RecordData) -> Result<(), DbError> {
            Ok(())
        }
        fn derive_legacy_record(&self, _: &str) -> Result<Option<RecordData>, DbError> {
            Ok(None)
        }
        fn delete_older_than(&self, _: Timestamp) -> Result<usize, DbError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_rehydrate_gives_up_after_retries() {
        let db = Arc::new(Unreachable {
            calls: AtomicU32::new(0),
        });
        let roster = roster();
        let store = TimeSeriesStore::new(roster.clone(), settings());

        let result = rehydrate(db.clone(), &store, &roster, Duration::from_secs(60), 1_000, Duration::from_millis(1)).await;

        assert!(matches!(result, Err(StartupError::Rehydrate { attempts: STARTUP_ATTEMPTS, .. })));
        assert_eq!(db.calls.load(Ordering::SeqCst), STARTUP_ATTEMPTS);
    }
}

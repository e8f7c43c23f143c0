//! SQLite database store implementation.

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Durable storage of samples and records.
///
/// Calls are synchronous; callers on the async side keep them off the hot
/// path (the scheduler hands writes to a batch writer task).
pub trait Persistence: Send + Sync {
    fn insert_sample(&self, sample: &StoredSample) -> Result<(), DbError> {
        self.insert_samples(std::slice::from_ref(sample))
    }

    fn insert_samples(&self, samples: &[StoredSample]) -> Result<(), DbError>;

    /// Samples with `start <= timestamp <= end`, oldest first.
    fn query_range(
        &self,
        host: Option<&str>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<StoredSample>, DbError>;

    fn get_record(&self, host: &str) -> Result<Option<RecordData>, DbError>;

    /// Insert `record` unless the host already has one. Returns whether it was inserted.
    fn upsert_record_if_absent(&self, host: &str, record: &RecordData) -> Result<bool, DbError>;

    /// Raise the stored record to `record`; never lowers it.
    fn update_record(&self, host: &str, record: &RecordData) -> Result<(), DbError>;

    /// Derive a record from raw samples for hosts that predate the record table.
    fn derive_legacy_record(&self, host: &str) -> Result<Option<RecordData>, DbError>;

    /// Delete samples older than `cutoff`, returning how many were removed.
    fn delete_older_than(&self, cutoff: Timestamp) -> Result<usize, DbError>;
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored samples (status output and tests).
    pub fn count_samples(&self) -> Result<i64, DbError> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM pings", [], |r| r.get(0))?)
    }
}

impl Persistence for Store {
    fn insert_samples(&self, samples: &[StoredSample]) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt =
                tx.prepare("INSERT INTO pings (timestamp, host, player_count) VALUES (?1, ?2, ?3)")?;

            for s in samples {
                stmt.execute(params![s.timestamp, s.host, s.player_count])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn query_range(
        &self,
        host: Option<&str>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<StoredSample>, DbError> {
        let conn = self.conn();

        let samples = match host {
            Some(host) => {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, host, player_count FROM pings
                     WHERE host = ?1 AND timestamp >= ?2 AND timestamp <= ?3 ORDER BY timestamp ASC",
                )?;
                let rows = stmt.query_map(params![host, start, end], sample_from_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, host, player_count FROM pings
                     WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY timestamp ASC",
                )?;
                let rows = stmt.query_map(params![start, end], sample_from_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
        };

        Ok(samples)
    }

    fn get_record(&self, host: &str) -> Result<Option<RecordData>, DbError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT player_count, timestamp FROM players_record WHERE host = ?1",
                params![host],
                |row| Ok(RecordData::new(row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_record_if_absent(&self, host: &str, record: &RecordData) -> Result<bool, DbError> {
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT INTO players_record (host, timestamp, player_count) VALUES (?1, ?2, ?3)
             ON CONFLICT(host) DO NOTHING",
            params![host, record.timestamp, record.player_count],
        )?;
        Ok(changed == 1)
    }

    fn update_record(&self, host: &str, record: &RecordData) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO players_record (host, timestamp, player_count) VALUES (?1, ?2, ?3)
             ON CONFLICT(host) DO UPDATE SET
             timestamp=excluded.timestamp, player_count=excluded.player_count
             WHERE excluded.player_count > players_record.player_count",
            params![host, record.timestamp, record.player_count],
        )?;
        Ok(())
    }

    fn derive_legacy_record(&self, host: &str) -> Result<Option<RecordData>, DbError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT player_count, timestamp FROM pings
                 WHERE host = ?1 AND player_count IS NOT NULL
                 ORDER BY player_count DESC, timestamp ASC LIMIT 1",
                params![host],
                |row| Ok(RecordData::new(row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(record)
    }

    fn delete_older_than(&self, cutoff: Timestamp) -> Result<usize, DbError> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM pings WHERE timestamp < ?1", params![cutoff])?;
        Ok(deleted)
    }
}

fn sample_from_row(row: &rusqlite::Row<'_>) -> SqlResult<StoredSample> {
    Ok(StoredSample {
        timestamp: row.get(0)?,
        host: row.get(1)?,
        player_count: row.get(2)?,
    })
}

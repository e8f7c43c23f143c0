//! In-memory time series for every monitored host.
//!
//! Each host owns a coarse window (long span, one point per
//! `graph_sample_interval`) and a fine window (short span, one point per
//! tick), plus its all-time record. Hosts are locked independently; the
//! shared timestamp axes have their own lock.

mod window;

pub use window::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::{RosterEntry, ServerConfig};
use crate::db::{HostId, RecordData, Timestamp};
use crate::probe::ProbeErrorKind;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SeriesError {
    #[error("unknown host id {0}")]
    UnknownHost(HostId),
    #[error("history has {timestamps} timestamps but {counts} counts")]
    MismatchedHistory { timestamps: usize, counts: usize },
}

/// Window sizing derived from configuration.
#[derive(Debug, Clone, Copy)]
pub struct WindowSettings {
    pub coarse: WindowBounds,
    pub fine: WindowBounds,
    pub graph_sample_interval_ms: i64,
}

impl WindowSettings {
    pub fn new(
        ping_interval: Duration,
        graph_duration: Duration,
        server_graph_duration: Duration,
        graph_sample_interval: Duration,
    ) -> Self {
        let coarse_step = ping_interval.max(graph_sample_interval);
        Self {
            coarse: WindowBounds::new(points_for(graph_duration, coarse_step), Some(graph_duration)),
            fine: WindowBounds::new(points_for(server_graph_duration, ping_interval), Some(server_graph_duration)),
            graph_sample_interval_ms: graph_sample_interval.as_millis() as i64,
        }
    }

    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self::new(
            cfg.ping_interval(),
            cfg.graph_duration(),
            cfg.server_graph_duration(),
            cfg.graph_sample_interval(),
        )
    }
}

/// `ceil(span / step)`, at least one point.
fn points_for(span: Duration, step: Duration) -> usize {
    let step = step.as_millis().max(1);
    (span.as_millis().div_ceil(step)).max(1) as usize
}

/// A tick in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tick {
    pub timestamp: Timestamp,
    /// Whether this tick also lands in the coarse windows.
    pub coarse: bool,
}

/// What an append changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub new_record: Option<RecordData>,
    pub peak_changed: bool,
}

/// Read-only view of one host for query and broadcast consumers.
#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub id: HostId,
    pub label: String,
    pub color: Option<String>,
    pub address: String,
    pub port: u16,
    pub coarse: WindowSnapshot,
    pub record: Option<RecordData>,
    pub graph_peak: Option<RecordData>,
    pub last_error: Option<ProbeErrorKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AxisSnapshot {
    pub coarse: Vec<Timestamp>,
    pub fine: Vec<Timestamp>,
}

#[derive(Debug)]
struct HostSeries {
    coarse: GraphWindow,
    fine: GraphWindow,
    record: Option<RecordData>,
    peak_index: Option<usize>,
    last_error: Option<ProbeErrorKind>,
}

impl HostSeries {
    fn new(settings: &WindowSettings) -> Self {
        Self {
            coarse: GraphWindow::new(settings.coarse),
            fine: GraphWindow::new(settings.fine),
            record: None,
            peak_index: None,
            last_error: None,
        }
    }

    fn graph_peak(&self) -> Option<RecordData> {
        let (timestamp, count) = self.coarse.get(self.peak_index?)?;
        Some(RecordData::new(count?, timestamp))
    }

    fn find_new_graph_peak(&mut self) -> bool {
        let before = self.graph_peak();
        self.peak_index = self.coarse.peak_index();
        self.graph_peak() != before
    }

    fn promote(&mut self, candidate: RecordData) -> bool {
        if RecordData::beats(&candidate, self.record.as_ref()) {
            self.record = Some(candidate);
            true
        } else {
            false
        }
    }

    fn observe(&mut self, timestamp: Timestamp, count: Option<u32>) -> Option<RecordData> {
        let candidate = RecordData::new(count?, timestamp);
        self.promote(candidate).then_some(candidate)
    }
}

#[derive(Debug)]
struct SharedAxis {
    coarse: TimeAxis,
    fine: TimeAxis,
}

/// Rolling history for the whole roster.
pub struct TimeSeriesStore {
    roster: Arc<[RosterEntry]>,
    settings: WindowSettings,
    hosts: Vec<Mutex<HostSeries>>,
    axis: Mutex<SharedAxis>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TimeSeriesStore {
    pub fn new(roster: Arc<[RosterEntry]>, settings: WindowSettings) -> Self {
        let hosts = roster.iter().map(|_| Mutex::new(HostSeries::new(&settings))).collect();
        Self {
            roster,
            settings,
            hosts,
            axis: Mutex::new(SharedAxis {
                coarse: TimeAxis::new(settings.coarse),
                fine: TimeAxis::new(settings.fine),
            }),
        }
    }

    fn host(&self, id: HostId) -> Result<MutexGuard<'_, HostSeries>, SeriesError> {
        self.hosts.get(id).map(lock).ok_or(SeriesError::UnknownHost(id))
    }

    // --- Write path ---

    /// Start a tick at `now`; decides whether it is a coarse point.
    pub fn begin_tick(&self, now: Timestamp) -> Tick {
        let axis = lock(&self.axis);
        let coarse = axis
            .coarse
            .last()
            .map_or(true, |last| now - last >= self.settings.graph_sample_interval_ms);
        Tick { timestamp: now, coarse }
    }

    /// Append a tick timestamp to the shared axes once every host has its point.
    pub fn complete_tick(&self, tick: &Tick) {
        let mut axis = lock(&self.axis);
        axis.fine.push(tick.timestamp);
        if tick.coarse {
            axis.coarse.push(tick.timestamp);
        }
    }

    /// Push onto both the coarse and fine windows.
    pub fn append(&self, id: HostId, timestamp: Timestamp, count: Option<u32>) -> Result<AppendOutcome, SeriesError> {
        let mut host = self.host(id)?;
        host.coarse.push(timestamp, count);
        host.fine.push(timestamp, count);
        let new_record = host.observe(timestamp, count);
        let peak_changed = host.find_new_graph_peak();
        Ok(AppendOutcome { new_record, peak_changed })
    }

    /// Push onto the fine window only (ticks between coarse points).
    pub fn append_fine(&self, id: HostId, timestamp: Timestamp, count: Option<u32>) -> Result<AppendOutcome, SeriesError> {
        let mut host = self.host(id)?;
        host.fine.push(timestamp, count);
        Ok(AppendOutcome {
            new_record: host.observe(timestamp, count),
            peak_changed: false,
        })
    }

    /// Append according to the tick's resolution.
    pub fn append_tick(&self, id: HostId, tick: &Tick, count: Option<u32>) -> Result<AppendOutcome, SeriesError> {
        if tick.coarse {
            self.append(id, tick.timestamp, count)
        } else {
            self.append_fine(id, tick.timestamp, count)
        }
    }

    pub fn set_last_error(&self, id: HostId, error: Option<ProbeErrorKind>) -> Result<(), SeriesError> {
        self.host(id)?.last_error = error;
        Ok(())
    }

    // --- Startup ---

    /// Rebuild the coarse axis from persisted tick timestamps in `[start, now]`.
    pub fn load_shared_axis(&self, start: Timestamp, now: Timestamp, timestamps: &[Timestamp]) {
        let in_range: Vec<Timestamp> = timestamps
            .iter()
            .copied()
            .filter(|t| (start..=now).contains(t))
            .collect();
        let kept = thin(&in_range, self.settings.graph_sample_interval_ms);
        lock(&self.axis).coarse.reload(kept.into_iter().map(|i| in_range[i]));
    }

    /// Rehydrate a host's coarse window from persisted samples, then reconcile
    /// the record against the loaded history.
    ///
    /// The window follows the coarse axis rebuilt by `load_shared_axis`: one
    /// point per axis timestamp, a gap where the host has no sample there.
    /// Returns the record if reconciliation promoted it.
    pub fn load_historical(
        &self,
        id: HostId,
        start: Timestamp,
        now: Timestamp,
        timestamps: &[Timestamp],
        counts: &[Option<u32>],
    ) -> Result<Option<RecordData>, SeriesError> {
        if timestamps.len() != counts.len() {
            return Err(SeriesError::MismatchedHistory {
                timestamps: timestamps.len(),
                counts: counts.len(),
            });
        }

        let loaded: HashMap<Timestamp, Option<u32>> = timestamps
            .iter()
            .copied()
            .zip(counts.iter().copied())
            .filter(|(t, _)| (start..=now).contains(t))
            .collect();

        // The raw peak, not the aligned one: thinning may skip the true maximum.
        let mut raw_peak: Option<RecordData> = None;
        for (&timestamp, &count) in &loaded {
            if let Some(count) = count {
                let candidate = RecordData::new(count, timestamp);
                let earlier_tie = raw_peak.is_some_and(|p| p.player_count == count && timestamp < p.timestamp);
                if earlier_tie || RecordData::beats(&candidate, raw_peak.as_ref()) {
                    raw_peak = Some(candidate);
                }
            }
        }

        let axis = lock(&self.axis).coarse.to_vec();
        let mut host = self.host(id)?;
        host.coarse
            .reload(axis.into_iter().map(|t| (t, loaded.get(&t).copied().flatten())));
        host.find_new_graph_peak();

        match raw_peak {
            Some(peak) if host.promote(peak) => {
                tracing::info!(
                    "Reconciled record for host {} to {} players at {}",
                    id,
                    peak.player_count,
                    peak.timestamp
                );
                Ok(Some(peak))
            }
            _ => Ok(None),
        }
    }

    /// Recompute the in-window peak. Returns whether it changed.
    pub fn find_new_graph_peak(&self, id: HostId) -> Result<bool, SeriesError> {
        Ok(self.host(id)?.find_new_graph_peak())
    }

    /// Raise the record to `candidate` if it is higher (or none exists).
    pub fn promote_record(&self, id: HostId, candidate: RecordData) -> Result<bool, SeriesError> {
        Ok(self.host(id)?.promote(candidate))
    }

    // --- Read path ---

    pub fn record(&self, id: HostId) -> Result<Option<RecordData>, SeriesError> {
        Ok(self.host(id)?.record)
    }

    pub fn graph_peak(&self, id: HostId) -> Result<Option<RecordData>, SeriesError> {
        Ok(self.host(id)?.graph_peak())
    }

    pub fn coarse_window(&self, id: HostId) -> Result<WindowSnapshot, SeriesError> {
        Ok(self.host(id)?.coarse.snapshot())
    }

    pub fn fine_window(&self, id: HostId) -> Result<WindowSnapshot, SeriesError> {
        Ok(self.host(id)?.fine.snapshot())
    }

    pub fn shared_axis(&self) -> AxisSnapshot {
        let axis = lock(&self.axis);
        AxisSnapshot {
            coarse: axis.coarse.to_vec(),
            fine: axis.fine.to_vec(),
        }
    }

    /// Snapshot every host. Each host is copied under its own lock.
    pub fn snapshot(&self) -> Vec<HostSnapshot> {
        self.roster
            .iter()
            .zip(&self.hosts)
            .map(|(entry, series)| {
                let series = lock(series);
                HostSnapshot {
                    id: entry.id,
                    label: entry.label.clone(),
                    color: entry.color.clone(),
                    address: entry.address.clone(),
                    port: entry.port,
                    coarse: series.coarse.snapshot(),
                    record: series.record,
                    graph_peak: series.graph_peak(),
                    last_error: series.last_error,
                }
            })
            .collect()
    }

    /// Records keyed by persistence key, for status output.
    pub fn records(&self) -> HashMap<String, Option<RecordData>> {
        self.roster
            .iter()
            .zip(&self.hosts)
            .map(|(entry, series)| (entry.host_key(), lock(series).record))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: usize) -> Arc<[RosterEntry]> {
        (0..n)
            .map(|i| RosterEntry::new(i, &format!("host{}", i), &format!("10.0.0.{}", i), 25565))
            .collect::<Vec<_>>()
            .into()
    }

    /// Every tick is coarse; capacity 5 on both resolutions.
    fn small_settings() -> WindowSettings {
        WindowSettings {
            coarse: WindowBounds::new(5, None),
            fine: WindowBounds::new(5, None),
            graph_sample_interval_ms: 0,
        }
    }

    #[test]
    fn test_window_settings_capacities() {
        let settings = WindowSettings::new(
            Duration::from_secs(3),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(180),
            Duration::from_secs(60),
        );
        assert_eq!(settings.coarse.capacity, 1440);
        assert_eq!(settings.fine.capacity, 60);

        let odd = WindowSettings::new(
            Duration::from_millis(7),
            Duration::from_millis(20),
            Duration::from_millis(20),
            Duration::ZERO,
        );
        assert_eq!(odd.coarse.capacity, 3);
    }

    #[test]
    fn test_append_keeps_parallel_lengths_and_capacity() {
        let store = TimeSeriesStore::new(roster(1), small_settings());
        for t in 0..12 {
            let count = if t % 4 == 0 { None } else { Some(t as u32) };
            store.append(0, t * 1000, count).unwrap();
            for window in [store.coarse_window(0).unwrap(), store.fine_window(0).unwrap()] {
                assert_eq!(window.timestamps.len(), window.counts.len());
                assert!(window.timestamps.len() <= 5);
            }
        }
    }

    #[test]
    fn test_record_is_non_decreasing_on_live_appends() {
        let store = TimeSeriesStore::new(roster(1), small_settings());
        let counts = [Some(3), None, Some(8), Some(2), Some(8), Some(11), None, Some(0)];
        let mut previous = 0;
        for (t, count) in counts.into_iter().enumerate() {
            store.append(0, t as i64, count).unwrap();
            let record = store.record(0).unwrap().map_or(0, |r| r.player_count);
            assert!(record >= previous);
            previous = record;
        }
        assert_eq!(store.record(0).unwrap(), Some(RecordData::new(11, 5)));
    }

    #[test]
    fn test_append_reports_new_record_only_when_exceeded() {
        let store = TimeSeriesStore::new(roster(1), small_settings());
        assert_eq!(store.append(0, 1, Some(4)).unwrap().new_record, Some(RecordData::new(4, 1)));
        assert_eq!(store.append(0, 2, Some(4)).unwrap().new_record, None);
        assert_eq!(store.append(0, 3, None).unwrap().new_record, None);
        assert_eq!(store.append_fine(0, 4, Some(6)).unwrap().new_record, Some(RecordData::new(6, 4)));
    }

    #[test]
    fn test_append_fine_leaves_coarse_untouched() {
        let store = TimeSeriesStore::new(roster(1), small_settings());
        store.append(0, 1, Some(1)).unwrap();
        store.append_fine(0, 2, Some(2)).unwrap();
        assert_eq!(store.coarse_window(0).unwrap().timestamps, vec![1]);
        assert_eq!(store.fine_window(0).unwrap().timestamps, vec![1, 2]);
    }

    #[test]
    fn test_begin_tick_gates_coarse_points() {
        let settings = WindowSettings {
            graph_sample_interval_ms: 60_000,
            ..small_settings()
        };
        let store = TimeSeriesStore::new(roster(1), settings);

        let first = store.begin_tick(1_000);
        assert!(first.coarse);
        store.complete_tick(&first);

        let second = store.begin_tick(4_000);
        assert!(!second.coarse);
        store.complete_tick(&second);

        let third = store.begin_tick(61_000);
        assert!(third.coarse);
        store.complete_tick(&third);

        let axis = store.shared_axis();
        assert_eq!(axis.coarse, vec![1_000, 61_000]);
        assert_eq!(axis.fine, vec![1_000, 4_000, 61_000]);
    }

    #[test]
    fn test_load_historical_reconciles_missing_record() {
        let store = TimeSeriesStore::new(roster(1), small_settings());
        let timestamps = [40, 70, 100, 130];
        let counts = [Some(10), None, Some(42), Some(17)];

        store.load_shared_axis(0, 200, &timestamps);
        let promoted = store.load_historical(0, 0, 200, &timestamps, &counts).unwrap();
        assert_eq!(promoted, Some(RecordData::new(42, 100)));
        assert_eq!(store.record(0).unwrap(), Some(RecordData::new(42, 100)));
        assert_eq!(store.graph_peak(0).unwrap(), Some(RecordData::new(42, 100)));
    }

    #[test]
    fn test_load_historical_never_lowers_record() {
        let store = TimeSeriesStore::new(roster(1), small_settings());
        store.promote_record(0, RecordData::new(90, 5)).unwrap();

        let promoted = store.load_historical(0, 0, 200, &[100], &[Some(42)]).unwrap();
        assert_eq!(promoted, None);
        assert_eq!(store.record(0).unwrap(), Some(RecordData::new(90, 5)));
    }

    #[test]
    fn test_load_historical_reconciles_peak_dropped_by_thinning() {
        let settings = WindowSettings {
            coarse: WindowBounds::new(100, None),
            fine: WindowBounds::new(100, None),
            graph_sample_interval_ms: 60,
        };
        let store = TimeSeriesStore::new(roster(1), settings);
        let timestamps = [0, 30, 60, 90];
        let counts = [Some(1), Some(50), Some(2), Some(3)];

        store.load_shared_axis(0, 100, &timestamps);
        store.load_historical(0, 0, 100, &timestamps, &counts).unwrap();
        assert_eq!(store.coarse_window(0).unwrap().timestamps, vec![0, 60]);
        assert_eq!(store.record(0).unwrap(), Some(RecordData::new(50, 30)));
        assert_eq!(store.graph_peak(0).unwrap(), Some(RecordData::new(2, 60)));
    }

    #[test]
    fn test_load_historical_ignores_out_of_range_samples() {
        let store = TimeSeriesStore::new(roster(1), small_settings());
        store.load_shared_axis(100, 200, &[50, 150, 250]);
        store
            .load_historical(0, 100, 200, &[50, 150, 250], &[Some(99), Some(1), Some(98)])
            .unwrap();
        assert_eq!(store.coarse_window(0).unwrap().timestamps, vec![150]);
        assert_eq!(store.record(0).unwrap(), Some(RecordData::new(1, 150)));
    }

    #[test]
    fn test_find_new_graph_peak_is_idempotent() {
        let store = TimeSeriesStore::new(roster(1), small_settings());
        store.load_shared_axis(0, 100, &[10, 20, 30]);
        store.load_historical(0, 0, 100, &[10, 20, 30], &[Some(3), Some(7), None]).unwrap();

        store.find_new_graph_peak(0).unwrap();
        let first = (store.record(0).unwrap(), store.graph_peak(0).unwrap());
        assert!(!store.find_new_graph_peak(0).unwrap());
        let second = (store.record(0).unwrap(), store.graph_peak(0).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_reload_then_live_matches_uninterrupted_window() {
        let settings = WindowSettings {
            coarse: WindowBounds::new(6, None),
            fine: WindowBounds::new(6, None),
            graph_sample_interval_ms: 0,
        };
        let history: Vec<(Timestamp, Option<u32>)> =
            (0..10).map(|t| (t * 10, if t == 4 { None } else { Some(t as u32) })).collect();

        let uninterrupted = TimeSeriesStore::new(roster(1), settings);
        for &(t, c) in &history {
            uninterrupted.append(0, t, c).unwrap();
        }

        let restarted = TimeSeriesStore::new(roster(1), settings);
        let (persisted, live) = history.split_at(7);
        let ts: Vec<Timestamp> = persisted.iter().map(|p| p.0).collect();
        let counts: Vec<Option<u32>> = persisted.iter().map(|p| p.1).collect();
        restarted.load_shared_axis(0, 60, &ts);
        restarted.load_historical(0, 0, 60, &ts, &counts).unwrap();
        for &(t, c) in live {
            restarted.append(0, t, c).unwrap();
        }

        assert_eq!(restarted.coarse_window(0).unwrap(), uninterrupted.coarse_window(0).unwrap());
        assert_eq!(restarted.record(0).unwrap(), uninterrupted.record(0).unwrap());
    }

    #[test]
    fn test_load_historical_follows_shared_axis() {
        let settings = WindowSettings {
            coarse: WindowBounds::new(100, None),
            fine: WindowBounds::new(100, None),
            graph_sample_interval_ms: 60,
        };
        let store = TimeSeriesStore::new(roster(3), settings);
        store.load_shared_axis(0, 100, &[0, 30, 60, 90]);

        // Host 1 joined at 30; host 2 has no history at all.
        store.load_historical(0, 0, 100, &[0, 30, 60, 90], &[Some(1), Some(2), Some(3), Some(4)]).unwrap();
        store.load_historical(1, 0, 100, &[30, 60, 90], &[Some(7), Some(8), Some(9)]).unwrap();
        store.load_historical(2, 0, 100, &[], &[]).unwrap();

        let axis = store.shared_axis().coarse;
        assert_eq!(axis, vec![0, 60]);
        for id in 0..3 {
            assert_eq!(store.coarse_window(id).unwrap().timestamps, axis);
        }
        assert_eq!(store.coarse_window(1).unwrap().counts, vec![None, Some(8)]);
        assert_eq!(store.coarse_window(2).unwrap().counts, vec![None, None]);
        assert_eq!(store.record(1).unwrap(), Some(RecordData::new(9, 90)));
        assert_eq!(store.record(2).unwrap(), None);
    }

    #[test]
    fn test_load_historical_rejects_mismatched_lengths() {
        let store = TimeSeriesStore::new(roster(1), small_settings());
        assert_eq!(
            store.load_historical(0, 0, 100, &[10, 20], &[Some(1)]),
            Err(SeriesError::MismatchedHistory { timestamps: 2, counts: 1 })
        );
        assert_eq!(store.record(0).unwrap(), None);
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let store = TimeSeriesStore::new(roster(2), small_settings());
        store.append(1, 10, Some(4)).unwrap();
        let snapshot = store.snapshot();
        store.append(1, 20, Some(5)).unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].label, "host1");
        assert_eq!(snapshot[1].coarse.timestamps, vec![10]);
        assert_eq!(snapshot[0].record, None);
        assert_eq!(store.coarse_window(1).unwrap().timestamps, vec![10, 20]);
    }

    #[test]
    fn test_unknown_host() {
        let store = TimeSeriesStore::new(roster(1), small_settings());
        assert_eq!(store.append(3, 1, Some(1)), Err(SeriesError::UnknownHost(3)));
    }
}

//! Scheduler module for running probe ticks over the roster.

mod retention;
mod startup;
mod writer;

pub use retention::*;
pub use startup::*;
pub use writer::*;

use crate::config::{RosterEntry, ServerConfig};
use crate::db::{HostId, RecordData, StoredSample, Timestamp};
use crate::probe::{ProbeError, ProbeErrorKind, ProbeResult, Prober, WireProber};
use crate::series::{AppendOutcome, Tick, TimeSeriesStore};

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};

/// Start jitter applied inside each probe task, to avoid a thundering herd.
const MAX_JITTER_MS: u64 = 100;

/// Extra allowance on top of the probe timeout before a task is abandoned.
const TASK_GRACE: Duration = Duration::from_millis(250);

/// Capacity of the tick event channel.
const EVENT_CAPACITY: usize = 16;

/// Everything a scheduler needs, handed over at construction.
pub struct SchedulerContext {
    pub roster: Arc<[RosterEntry]>,
    pub store: Arc<TimeSeriesStore>,
    pub config: ServerConfig,
    /// Queue to the persistence batch writer; `None` disables persistence.
    pub persist_tx: Option<mpsc::Sender<PersistOp>>,
}

/// Per-host result of one tick, for incremental push to viewers.
#[derive(Debug, Clone, Serialize)]
pub struct HostUpdate {
    pub host_id: HostId,
    pub player_count: Option<u32>,
    pub max_players: Option<u32>,
    pub version_name: Option<String>,
    pub motd: Option<String>,
    /// Set only when this tick raised the record.
    pub record: Option<RecordData>,
    /// Set only when this tick moved the in-window peak.
    pub graph_peak: Option<RecordData>,
    pub error: Option<ProbeErrorKind>,
}

/// Fired once per completed tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickEvent {
    pub timestamp: Timestamp,
    /// Whether this tick added a coarse (history graph) point.
    pub coarse: bool,
    pub updates: Vec<HostUpdate>,
}

/// Drives probe ticks for the whole roster.
pub struct Scheduler<P: Prober = WireProber> {
    ctx: SchedulerContext,
    prober: Arc<P>,
    events: broadcast::Sender<TickEvent>,
    latest: RwLock<Option<TickEvent>>,
    stop: broadcast::Sender<()>,
}

impl<P: Prober> Scheduler<P> {
    pub fn new(ctx: SchedulerContext, prober: P) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stop, _) = broadcast::channel(1);
        Self {
            ctx,
            prober: Arc::new(prober),
            events,
            latest: RwLock::new(None),
            stop,
        }
    }

    /// Subscribe to tick events.
    pub fn subscribe(&self) -> broadcast::Receiver<TickEvent> {
        self.events.subscribe()
    }

    /// The most recent tick event, if any tick has completed.
    pub async fn latest(&self) -> Option<TickEvent> {
        self.latest.read().await.clone()
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.ctx.store
    }

    /// Arm the tick timer. Ticks never overlap: a late tick is skipped
    /// rather than run concurrently with the previous one.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        let mut stop_rx = self.stop.subscribe();

        tracing::info!(
            "Starting scheduler with {} servers every {:?}",
            self.ctx.roster.len(),
            self.ctx.config.ping_interval()
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.ctx.config.ping_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        // In-flight probes are abandoned (and their sockets
                        // closed) if a stop arrives mid-tick.
                        tokio::select! {
                            _ = stop_rx.recv() => break,
                            _ = scheduler.run_tick() => {}
                        }
                    }
                }
            }
            tracing::info!("Scheduler stopped");
        })
    }

    /// Stop the tick loop.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    /// Run one tick: probe every host concurrently, record each result as it
    /// arrives, then advance the shared axis and publish the tick event.
    pub async fn run_tick(&self) -> TickEvent {
        let roster = self.ctx.roster.clone();
        let tick = self.ctx.store.begin_tick(Utc::now().timestamp_millis());
        let timeout = self.ctx.config.connect_timeout();
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for entry in roster.iter() {
            let entry = entry.clone();
            let prober = self.prober.clone();
            tasks.spawn(async move {
                let host_id = entry.id;
                let jitter = rand::random::<u64>() % MAX_JITTER_MS.min(timeout.as_millis() as u64 / 10).max(1);
                tokio::time::sleep(Duration::from_millis(jitter)).await;

                let budget = timeout.saturating_sub(Duration::from_millis(jitter));
                let probe_start = Instant::now();
                let result = match tokio::time::timeout(budget + TASK_GRACE, prober.probe(entry, budget)).await {
                    Ok(result) => result,
                    Err(_) => ProbeResult::failed(ProbeError::Timeout(budget), 0, probe_start.elapsed()),
                };
                (host_id, result)
            });
        }

        let mut updates: Vec<Option<HostUpdate>> = vec![None; roster.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host_id, result)) => {
                    if let Some(entry) = roster.get(host_id) {
                        updates[host_id] = Some(self.record(&tick, entry, &result));
                    }
                }
                Err(e) => tracing::error!("Probe task failed: {}", e),
            }
        }

        // A task that died without reporting still owes its host a gap.
        for (host_id, slot) in updates.iter_mut().enumerate() {
            if slot.is_none() {
                let result = ProbeResult::failed(ProbeError::ProtocolMismatch, 0, Duration::ZERO);
                *slot = Some(self.record(&tick, &roster[host_id], &result));
            }
        }

        self.ctx.store.complete_tick(&tick);

        let event = TickEvent {
            timestamp: tick.timestamp,
            coarse: tick.coarse,
            updates: updates.into_iter().flatten().collect(),
        };
        tracing::debug!(
            "Tick {} complete in {:?}: {}/{} online",
            tick.timestamp,
            started.elapsed(),
            event.updates.iter().filter(|u| u.player_count.is_some()).count(),
            event.updates.len()
        );

        *self.latest.write().await = Some(event.clone());
        let _ = self.events.send(event.clone());
        event
    }

    /// Commit one host's result to the store and the persistence queue.
    fn record(&self, tick: &Tick, entry: &RosterEntry, result: &ProbeResult) -> HostUpdate {
        let count = result.player_count();
        let error = result.error();

        if let Some(e) = error {
            if self.ctx.config.log_failed_pings {
                tracing::warn!(host = %entry.label, "Failed to ping {}:{}: {}", entry.address, entry.port, e);
            }
        }

        let outcome = match self.ctx.store.append_tick(entry.id, tick, count) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Failed to record sample for {}: {}", entry.label, e);
                AppendOutcome::default()
            }
        };
        let _ = self.ctx.store.set_last_error(entry.id, error.map(ProbeError::kind));

        if let Some(tx) = &self.ctx.persist_tx {
            let key = entry.host_key();
            enqueue(
                tx,
                PersistOp::Sample(StoredSample {
                    timestamp: tick.timestamp,
                    host: key.clone(),
                    player_count: count,
                }),
            );
            if let Some(record) = outcome.new_record {
                enqueue(tx, PersistOp::Record { host: key, record });
            }
        }

        let graph_peak = if outcome.peak_changed {
            self.ctx.store.graph_peak(entry.id).ok().flatten()
        } else {
            None
        };

        let status = result.status();
        HostUpdate {
            host_id: entry.id,
            player_count: count,
            max_players: status.map(|s| s.max_players),
            version_name: status.and_then(|s| s.version_name.clone()),
            motd: status.map(|s| s.motd.clone()),
            record: outcome.new_record,
            graph_peak,
            error: error.map(ProbeError::kind),
        }
    }
}

/// Hand an operation to the batch writer without waiting on it.
fn enqueue(tx: &mpsc::Sender<PersistOp>, op: PersistOp) {
    if let Err(e) = tx.try_send(op) {
        tracing::error!("Dropping persistence write: {}", e);
    }
}

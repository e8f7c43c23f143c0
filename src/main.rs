//! craftwatch - Minecraft server population monitor
//!
//! Pings a fixed roster of servers over their native status protocol and
//! keeps rolling player-count history and all-time records.

mod config;
mod db;
mod probe;
mod scheduler;
mod series;
mod web;

use config::ServerConfig;
use db::{Persistence, Store};
use probe::WireProber;
use scheduler::{RetentionManager, Scheduler, SchedulerContext};
use series::{TimeSeriesStore, WindowSettings};
use web::Server;

use chrono::Utc;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("craftwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    cfg.validate()?;
    let roster: Arc<[config::RosterEntry]> = config::load_roster(&cfg.servers_path)?.into();
    tracing::info!("Loaded {} servers from {}", roster.len(), cfg.servers_path);

    let store = Arc::new(TimeSeriesStore::new(roster.clone(), WindowSettings::from_config(&cfg)));

    let mut persist_tx = None;
    let mut writer = None;
    let mut retention = None;
    if cfg.log_to_database {
        tracing::info!("Using database at {}", cfg.db_path);
        let persistence: Arc<dyn Persistence> = Arc::new(Store::new(&cfg.db_path)?);

        // Monitoring without a baseline is a degraded mode; refuse to start.
        let summary = scheduler::rehydrate(
            persistence.clone(),
            &store,
            &roster,
            cfg.graph_duration(),
            Utc::now().timestamp_millis(),
            scheduler::STARTUP_BACKOFF,
        )
        .await?;
        tracing::info!(
            "Loaded {} samples; records: {} stored, {} derived, {} reconciled",
            summary.samples,
            summary.records_loaded,
            summary.records_derived,
            summary.records_reconciled
        );

        let manager = RetentionManager::new(persistence.clone(), cfg.graph_duration(), cfg.cleanup_interval());
        manager.start();
        retention = Some(manager);

        let (tx, handle) = scheduler::spawn_batch_writer(persistence);
        persist_tx = Some(tx);
        writer = Some(handle);
    } else {
        tracing::warn!("Database logging disabled; history and records will not survive restarts");
    }

    // Create and start scheduler
    let scheduler = Arc::new(Scheduler::new(
        SchedulerContext {
            roster,
            store: store.clone(),
            config: cfg.clone(),
            persist_tx,
        },
        WireProber,
    ));
    let ticker = scheduler.start();

    // Serve the query API until Ctrl-C
    let server = Server::new(cfg, store, scheduler.clone());
    server
        .start(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    scheduler.stop();
    let _ = ticker.await;
    if let Some(manager) = retention {
        manager.stop().await;
    }

    // Dropping the last sender lets the writer flush and exit.
    drop(server);
    drop(scheduler);
    if let Some(handle) = writer {
        let _ = handle.await;
    }

    Ok(())
}

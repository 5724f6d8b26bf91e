//! Standalone mode: every subsystem in one process.
//!
//! The daemon:
//! 1. Opens the keyspace and checkpoint databases
//! 2. Starts the owner collector and the compaction loop
//! 3. Starts one controller per configured kind
//! 4. Serves the REST API until Ctrl-C or a fatal controller error

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use keel_controller::{Controller, Diagnostics, HandlerTable};
use keel_core::KeelConfig;
use keel_state::{CheckpointStore, Keyspace, OwnerCollector, StateResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Run the daemon until shutdown.
pub async fn run_daemon(config: KeelConfig) -> anyhow::Result<()> {
    info!("keel daemon starting");

    let data_dir = &config.store.data_dir;
    std::fs::create_dir_all(data_dir)?;

    // ── Storage ────────────────────────────────────────────────

    let keyspace_path = data_dir.join("keyspace.redb");
    let keyspace = Keyspace::open(&keyspace_path)?;
    info!(path = ?keyspace_path, revision = keyspace.current_revision()?, "keyspace opened");

    let checkpoint_path = data_dir.join("checkpoints.redb");
    let checkpoints = CheckpointStore::open(&checkpoint_path)?;
    info!(path = ?checkpoint_path, "checkpoint store opened");

    let diagnostics = Diagnostics::new();

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // ── Background tasks ───────────────────────────────────────

    let collector = OwnerCollector::new(keyspace.clone());
    let collector_shutdown = shutdown_rx.clone();
    let collector_handle = tokio::spawn(async move {
        collector.run(collector_shutdown).await;
    });

    let compaction_handle = if config.store.compact_interval_secs > 0 {
        let keyspace = keyspace.clone();
        let interval = Duration::from_secs(config.store.compact_interval_secs);
        let retain = config.store.retain_revisions;
        let shutdown = shutdown_rx.clone();
        info!(interval_secs = interval.as_secs(), retain, "compaction enabled");
        Some(tokio::spawn(run_compaction(keyspace, interval, retain, shutdown)))
    } else {
        info!("compaction disabled");
        None
    };

    // ── Controllers ────────────────────────────────────────────

    let table = Arc::new(HandlerTable::standard(&config.kinds));
    let mut controller_handles: Vec<JoinHandle<bool>> = Vec::new();
    for kind in config.kinds.iter().copied() {
        let controller = Controller::new(
            kind,
            keyspace.clone(),
            checkpoints.clone(),
            config.controller.clone(),
            diagnostics.clone(),
        )
        .with_table(table.clone());
        let shutdown = shutdown_rx.clone();
        let stop_all = shutdown_tx.clone();
        controller_handles.push(tokio::spawn(async move {
            match controller.run(shutdown).await {
                Ok(()) => true,
                Err(e) => {
                    error!(%kind, error = %e, "controller failed, shutting down");
                    let _ = stop_all.send(true);
                    false
                }
            }
        }));
    }
    info!(kinds = ?config.kinds, "controllers started");

    // ── API server ─────────────────────────────────────────────

    let router = keel_api::build_router(keyspace.clone(), diagnostics);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let mut server_shutdown = shutdown_rx.clone();
    let signal_tx = shutdown_tx.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("shutdown signal received");
            }
            _ = server_shutdown.wait_for(|stop| *stop) => {}
        }
        let _ = signal_tx.send(true);
    });

    server.await?;
    let _ = shutdown_tx.send(true);

    // Wait for background tasks.
    let mut healthy = true;
    for handle in controller_handles {
        healthy &= handle.await.unwrap_or(false);
    }
    keyspace.disconnect_watchers();
    let _ = collector_handle.await;
    if let Some(handle) = compaction_handle {
        let _ = handle.await;
    }

    info!("keel daemon stopped");
    if !healthy {
        anyhow::bail!("a controller stopped on an unrecoverable error");
    }
    Ok(())
}

/// Compact history so that only the last `retain` revisions stay
/// replayable. Returns the number of events removed.
fn compact_history(keyspace: &Keyspace, retain: u64) -> StateResult<u64> {
    let current = keyspace.current_revision()?;
    let target = current.saturating_sub(retain);
    if target == 0 {
        return Ok(0);
    }
    keyspace.compact(target)
}

async fn run_compaction(
    keyspace: Keyspace,
    interval: Duration,
    retain: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match compact_history(&keyspace, retain) {
                    Ok(removed) => debug!(removed, "compaction pass finished"),
                    Err(e) => warn!(error = %e, "compaction failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("compaction loop stopped");
}

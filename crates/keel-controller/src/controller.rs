//! Per-kind controller — supervises one listener + reconciler pair.
//!
//! The controller loads the kind's checkpoint, opens a listener from it
//! and feeds the reconciler until shutdown. A failed or interrupted watch
//! abandons in-flight work and restarts from the last checkpoint after a
//! capped backoff. A corrupt checkpoint stops the controller.

use std::sync::Arc;

use keel_core::AppKind;
use keel_core::config::ControllerConfig;
use keel_state::{CheckpointStore, Keyspace};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::backoff::RetryBackoff;
use crate::children::ChildResourceManager;
use crate::diagnostics::Diagnostics;
use crate::dispatch::{HandlerTable, ReconcileContext};
use crate::error::ReconcileResult;
use crate::gc::GarbageCollector;
use crate::listener::WatchListener;
use crate::reconciler::{Reconciler, ReconcilerSettings, RunExit};

pub struct Controller {
    kind: AppKind,
    keyspace: Keyspace,
    checkpoints: CheckpointStore,
    config: ControllerConfig,
    diagnostics: Diagnostics,
    table: Arc<HandlerTable>,
}

impl Controller {
    pub fn new(
        kind: AppKind,
        keyspace: Keyspace,
        checkpoints: CheckpointStore,
        config: ControllerConfig,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            kind,
            keyspace,
            checkpoints,
            config,
            diagnostics,
            table: Arc::new(HandlerTable::standard(&AppKind::ALL)),
        }
    }

    /// Share one handler table between controllers.
    pub fn with_table(mut self, table: Arc<HandlerTable>) -> Self {
        self.table = table;
        self
    }

    /// Run until shutdown. Returns an error only for failures a restart
    /// cannot fix.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ReconcileResult<()> {
        let prefix = self.kind.prefix();

        // Fails loudly on a corrupt entry before any work starts.
        if let Some(checkpoint) = self.checkpoints.load(&prefix)? {
            self.diagnostics
                .record_checkpoint(self.kind, checkpoint.last_processed_revision);
            info!(
                kind = %self.kind,
                revision = checkpoint.last_processed_revision,
                "loaded checkpoint"
            );
        }

        let (tombstone_tx, tombstone_rx) = mpsc::unbounded_channel();
        let gc = GarbageCollector::new(
            self.keyspace.clone(),
            self.diagnostics.clone(),
            self.config.gc_grace(),
        );
        let gc_task = tokio::spawn(gc.run(tombstone_rx, shutdown.clone()));

        let ctx = ReconcileContext {
            kind: self.kind,
            children: ChildResourceManager::new(
                self.keyspace.clone(),
                self.config.max_conflict_attempts,
            ),
            tombstones: tombstone_tx,
            diagnostics: self.diagnostics.clone(),
        };
        let mut reconciler = Reconciler::new(
            ctx,
            self.table.clone(),
            self.checkpoints.clone(),
            ReconcilerSettings {
                workers: self.config.workers,
                batch_limit: self.config.batch_limit,
                retry_base: self.config.restart_backoff(),
                retry_max: self.config.max_restart_backoff(),
            },
        );
        let listener = WatchListener::new(self.keyspace.clone(), prefix.clone());
        let mut backoff =
            RetryBackoff::new(self.config.restart_backoff(), self.config.max_restart_backoff());

        info!(kind = %self.kind, %prefix, "controller started");
        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let checkpoint = match self.checkpoints.load(&prefix) {
                Ok(checkpoint) => checkpoint,
                Err(e) => break Err(e.into()),
            };
            let batches_before = reconciler.stats().batches;

            let outcome = match listener.resume(checkpoint.as_ref()) {
                Ok(mut source) => reconciler.run(&mut source, &mut shutdown).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(RunExit::Shutdown) => break Ok(()),
                Err(e) if e.is_fatal() => {
                    error!(kind = %self.kind, error = %e, "controller stopping");
                    break Err(e);
                }
                Err(e) => {
                    if reconciler.stats().batches > batches_before {
                        backoff.reset();
                    }
                    let delay = backoff.fail();
                    warn!(
                        kind = %self.kind,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "listener interrupted, restarting from checkpoint"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break Ok(()),
                    }
                }
            }
        };

        reconciler.log_summary();
        gc_task.abort();
        info!(kind = %self.kind, "controller stopped");
        result
    }
}

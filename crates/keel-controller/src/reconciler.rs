//! Reconciler — drains events in batches, runs passes, advances the
//! checkpoint.
//!
//! Each batch is coalesced by key (the last event per key wins) and the
//! surviving events run concurrently on a bounded pool of blocking workers,
//! so two passes for one key never overlap. The checkpoint moves to the
//! highest revision of the batch only once every pass in it succeeded:
//! failed passes are retried with capped backoff, malformed events are
//! skipped for good.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keel_core::{AppKind, ChangeEvent, Revision};
use keel_state::CheckpointStore;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryBackoff;
use crate::diagnostics::{Diagnostics, ReconcilePhase};
use crate::dispatch::{HandlerTable, PassOutcome, ReconcileContext};
use crate::error::{ReconcileError, ReconcileResult};
use crate::listener::EventSource;

/// Tuning for one reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub workers: usize,
    pub batch_limit: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

/// Why [`Reconciler::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
}

/// Counters kept across runs, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub batches: u64,
    pub passes: u64,
    pub writes: u64,
    pub skipped_malformed: u64,
    pub retries: u64,
}

pub struct Reconciler {
    kind: AppKind,
    prefix: String,
    ctx: Arc<ReconcileContext>,
    table: Arc<HandlerTable>,
    checkpoints: CheckpointStore,
    diagnostics: Diagnostics,
    pool: Arc<Semaphore>,
    settings: ReconcilerSettings,
    stats: ReconcileStats,
}

/// Keep only the last event per key, ordered by revision.
pub fn coalesce(batch: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut latest: BTreeMap<String, ChangeEvent> = BTreeMap::new();
    for event in batch {
        match latest.get(&event.key) {
            Some(existing) if existing.mod_revision > event.mod_revision => {}
            _ => {
                latest.insert(event.key.clone(), event);
            }
        }
    }
    let mut events: Vec<ChangeEvent> = latest.into_values().collect();
    events.sort_by_key(|event| event.mod_revision);
    events
}

impl Reconciler {
    pub fn new(
        ctx: ReconcileContext,
        table: Arc<HandlerTable>,
        checkpoints: CheckpointStore,
        settings: ReconcilerSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        Self {
            kind: ctx.kind,
            prefix: ctx.kind.prefix(),
            diagnostics: ctx.diagnostics.clone(),
            ctx: Arc::new(ctx),
            table,
            checkpoints,
            pool: Arc::new(Semaphore::new(workers)),
            settings,
            stats: ReconcileStats::default(),
        }
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Consume `source` until shutdown. An error means the source can no
    /// longer be trusted; the caller reopens it from the checkpoint.
    pub async fn run(
        &mut self,
        source: &mut EventSource,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReconcileResult<RunExit> {
        loop {
            let first = tokio::select! {
                next = source.next() => next?,
                _ = shutdown.changed() => return Ok(RunExit::Shutdown),
            };

            let mut batch = vec![first];
            while batch.len() < self.settings.batch_limit.max(1) {
                match source.try_next()? {
                    Some(event) => batch.push(event),
                    None => break,
                }
            }

            let checkpointable = !source.in_snapshot();
            if !self.process_batch(batch, checkpointable, shutdown).await? {
                return Ok(RunExit::Shutdown);
            }
        }
    }

    /// Run one batch to completion. Returns `false` if shutdown
    /// interrupted the retries.
    pub async fn process_batch(
        &mut self,
        batch: Vec<ChangeEvent>,
        checkpointable: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReconcileResult<bool> {
        let Some(high) = batch.iter().map(|event| event.mod_revision).max() else {
            return Ok(true);
        };
        let received = batch.len();
        let mut pending = coalesce(batch);
        debug!(
            kind = %self.kind,
            received,
            passes = pending.len(),
            high,
            "processing batch"
        );

        let mut backoff = RetryBackoff::new(self.settings.retry_base, self.settings.retry_max);
        let mut succeeded = Vec::new();
        loop {
            let failed = self.run_passes(pending, &mut succeeded).await?;
            if failed.is_empty() {
                break;
            }
            self.stats.retries += 1;
            let delay = backoff.fail();
            warn!(
                kind = %self.kind,
                failed = failed.len(),
                attempt = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                "reconcile passes failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Ok(false),
            }
            pending = failed;
        }

        self.stats.batches += 1;
        if checkpointable {
            self.checkpoint(high)?;
        }
        for (key, revision) in succeeded {
            self.diagnostics.finish_pass(self.kind, &key, revision, None);
        }
        Ok(true)
    }

    /// Run passes concurrently; returns the events whose pass failed
    /// transiently. Keys whose pass completed are appended to `succeeded`
    /// and wait in CHECKPOINTING until the batch commits.
    async fn run_passes(
        &mut self,
        events: Vec<ChangeEvent>,
        succeeded: &mut Vec<(String, Revision)>,
    ) -> ReconcileResult<Vec<ChangeEvent>> {
        let mut tasks = JoinSet::new();
        for event in events {
            let permit = self
                .pool
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ReconcileError::Worker(e.to_string()))?;
            let ctx = self.ctx.clone();
            let table = self.table.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = table.dispatch(&ctx, &event);
                (event, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (event, result) = joined.map_err(|e| ReconcileError::Worker(e.to_string()))?;
            self.stats.passes += 1;
            match result {
                Ok(outcome) => {
                    if let PassOutcome::Reconciled { applied, .. } = outcome {
                        self.stats.writes += applied as u64;
                    }
                    self.diagnostics.set_phase(
                        self.kind,
                        &event.key,
                        ReconcilePhase::Checkpointing,
                        event.mod_revision,
                    );
                    succeeded.push((event.key, event.mod_revision));
                }
                Err(e) if e.is_malformed() => {
                    self.stats.skipped_malformed += 1;
                    warn!(
                        kind = %self.kind,
                        key = %event.key,
                        revision = event.mod_revision,
                        error = %e,
                        "skipping malformed event"
                    );
                    self.diagnostics.finish_pass(
                        self.kind,
                        &event.key,
                        event.mod_revision,
                        Some(e.to_string()),
                    );
                }
                Err(e) => {
                    error!(
                        kind = %self.kind,
                        key = %event.key,
                        revision = event.mod_revision,
                        error = %e,
                        "reconcile pass failed"
                    );
                    self.diagnostics.finish_pass(
                        self.kind,
                        &event.key,
                        event.mod_revision,
                        Some(e.to_string()),
                    );
                    failed.push(event);
                }
            }
        }
        failed.sort_by_key(|event| event.mod_revision);
        Ok(failed)
    }

    fn checkpoint(&self, revision: Revision) -> ReconcileResult<()> {
        if self.checkpoints.advance(&self.prefix, revision)? {
            debug!(kind = %self.kind, revision, "checkpoint advanced");
        }
        self.diagnostics.record_checkpoint(self.kind, revision);
        Ok(())
    }

    pub fn log_summary(&self) {
        info!(
            kind = %self.kind,
            batches = self.stats.batches,
            passes = self.stats.passes,
            writes = self.stats.writes,
            skipped = self.stats.skipped_malformed,
            "reconciler stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use keel_core::EventType;

    use super::*;

    fn event(key: &str, revision: Revision) -> ChangeEvent {
        ChangeEvent {
            event_type: EventType::Put,
            key: key.into(),
            value: Some(b"{}".to_vec()),
            prev_value: None,
            create_revision: 1,
            mod_revision: revision,
            version: 1,
        }
    }

    #[test]
    fn coalesce_keeps_last_event_per_key() {
        let events = coalesce(vec![
            event("/a", 3),
            event("/b", 4),
            event("/a", 5),
            event("/c", 6),
            event("/b", 7),
        ]);
        let revisions: Vec<_> = events.iter().map(|e| (e.key.as_str(), e.mod_revision)).collect();
        assert_eq!(revisions, vec![("/a", 5), ("/c", 6), ("/b", 7)]);
    }

    #[test]
    fn coalesce_snapshot_events_keeps_one_per_key() {
        let events = coalesce(vec![event("/a", 9), event("/b", 9)]);
        assert_eq!(events.len(), 2);
    }
}

//! Read-only diagnostics shared by every controller task.
//!
//! Holds the checkpoint revision per kind, recent `OrphanDetected` records,
//! and the reconcile phase of every key seen so far. Written from worker
//! threads, read by the API.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use keel_core::{AppKind, Revision};
use serde::Serialize;

/// Orphan records kept before the oldest are dropped.
const MAX_ORPHANS: usize = 256;

/// Per-key reconcile state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcilePhase {
    Idle,
    Extracting,
    Diffing,
    Applying,
    Checkpointing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseEntry {
    pub kind: AppKind,
    pub key: String,
    pub phase: ReconcilePhase,
    /// Revision of the event being (or last) handled.
    pub revision: Revision,
    /// Error of the last failed pass, cleared on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Children still present after a parent's grace period expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanDetected {
    pub kind: AppKind,
    pub namespace: String,
    pub parent: String,
    pub parent_uid: String,
    pub children: Vec<String>,
    pub detected_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointStatus {
    pub kind: AppKind,
    pub last_processed_revision: Revision,
}

#[derive(Default)]
struct Inner {
    checkpoints: BTreeMap<AppKind, Revision>,
    orphans: VecDeque<OrphanDetected>,
    phases: BTreeMap<String, PhaseEntry>,
}

#[derive(Clone, Default)]
pub struct Diagnostics {
    inner: Arc<RwLock<Inner>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer leaves plain data behind; keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_checkpoint(&self, kind: AppKind, revision: Revision) {
        let mut inner = self.write();
        let entry = inner.checkpoints.entry(kind).or_insert(revision);
        *entry = (*entry).max(revision);
    }

    pub fn checkpoint(&self, kind: AppKind) -> Option<Revision> {
        self.read().checkpoints.get(&kind).copied()
    }

    pub fn checkpoints(&self) -> Vec<CheckpointStatus> {
        self.read()
            .checkpoints
            .iter()
            .map(|(kind, revision)| CheckpointStatus {
                kind: *kind,
                last_processed_revision: *revision,
            })
            .collect()
    }

    pub fn record_orphan(&self, orphan: OrphanDetected) {
        let mut inner = self.write();
        if inner.orphans.len() == MAX_ORPHANS {
            inner.orphans.pop_front();
        }
        inner.orphans.push_back(orphan);
    }

    pub fn orphans(&self) -> Vec<OrphanDetected> {
        self.read().orphans.iter().cloned().collect()
    }

    pub fn set_phase(&self, kind: AppKind, key: &str, phase: ReconcilePhase, revision: Revision) {
        let mut inner = self.write();
        let entry = inner
            .phases
            .entry(key.to_string())
            .or_insert_with(|| PhaseEntry {
                kind,
                key: key.to_string(),
                phase,
                revision,
                last_error: None,
            });
        entry.phase = phase;
        entry.revision = revision;
    }

    /// Return a key to IDLE, recording the outcome of its pass.
    pub fn finish_pass(&self, kind: AppKind, key: &str, revision: Revision, error: Option<String>) {
        self.set_phase(kind, key, ReconcilePhase::Idle, revision);
        if let Some(entry) = self.write().phases.get_mut(key) {
            entry.last_error = error;
        }
    }

    pub fn phase(&self, key: &str) -> Option<ReconcilePhase> {
        self.read().phases.get(key).map(|entry| entry.phase)
    }

    pub fn phases(&self) -> Vec<PhaseEntry> {
        self.read().phases.values().cloned().collect()
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_never_regress() {
        let diag = Diagnostics::new();
        diag.record_checkpoint(AppKind::SimpleApp, 10);
        diag.record_checkpoint(AppKind::SimpleApp, 7);
        assert_eq!(diag.checkpoint(AppKind::SimpleApp), Some(10));
        assert_eq!(diag.checkpoint(AppKind::ConfigMapApp), None);
    }

    #[test]
    fn orphans_are_bounded() {
        let diag = Diagnostics::new();
        for i in 0..(MAX_ORPHANS + 3) {
            diag.record_orphan(OrphanDetected {
                kind: AppKind::ConfigMapApp,
                namespace: "default".into(),
                parent: format!("app-{i}"),
                parent_uid: format!("uid-{i}"),
                children: vec![],
                detected_at: 0,
            });
        }
        let orphans = diag.orphans();
        assert_eq!(orphans.len(), MAX_ORPHANS);
        assert_eq!(orphans[0].parent, "app-3");
    }

    #[test]
    fn finish_pass_returns_to_idle_with_error() {
        let diag = Diagnostics::new();
        diag.set_phase(AppKind::SimpleApp, "/k", ReconcilePhase::Applying, 4);
        assert_eq!(diag.phase("/k"), Some(ReconcilePhase::Applying));

        diag.finish_pass(AppKind::SimpleApp, "/k", 4, Some("conflict".into()));
        let entry = &diag.phases()[0];
        assert_eq!(entry.phase, ReconcilePhase::Idle);
        assert_eq!(entry.last_error.as_deref(), Some("conflict"));
    }
}

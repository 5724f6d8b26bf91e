//! Garbage collector — confirms cascading deletes.
//!
//! Deleting a parent is left entirely to the store's owner-reference
//! cascade. For every tombstone the collector polls until no record names
//! the parent's uid as an owner, or until the grace period expires, in
//! which case it records [`OrphanDetected`]. It never deletes anything.

use std::time::Duration;

use keel_core::objects::owner_uids;
use keel_core::{REGISTRY_ROOT, Tombstone};
use keel_state::Keyspace;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::diagnostics::{Diagnostics, OrphanDetected, epoch_secs};
use crate::error::ReconcileResult;

/// Interval between checks while waiting for a cascade.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sending half handed to the reconciler.
pub type TombstoneSender = mpsc::UnboundedSender<Tombstone>;

#[derive(Clone)]
pub struct GarbageCollector {
    keyspace: Keyspace,
    diagnostics: Diagnostics,
    grace: Duration,
}

impl GarbageCollector {
    pub fn new(keyspace: Keyspace, diagnostics: Diagnostics, grace: Duration) -> Self {
        Self {
            keyspace,
            diagnostics,
            grace,
        }
    }

    /// Keys of every record still owned by the tombstone's parent.
    pub fn remaining_children(&self, tombstone: &Tombstone) -> ReconcileResult<Vec<String>> {
        let snapshot = self.keyspace.list(REGISTRY_ROOT)?;
        Ok(snapshot
            .items
            .into_iter()
            .filter(|kv| owner_uids(&kv.value).iter().any(|uid| *uid == tombstone.uid))
            .map(|kv| kv.key)
            .collect())
    }

    /// Wait up to the grace period for the parent's children to vanish.
    /// Returns the orphan record if some remain.
    pub async fn confirm(&self, tombstone: &Tombstone) -> Option<OrphanDetected> {
        let deadline = tokio::time::Instant::now() + self.grace;
        let mut remaining = Vec::new();

        loop {
            match self.remaining_children(tombstone) {
                Ok(children) if children.is_empty() => {
                    debug!(
                        kind = %tombstone.kind,
                        namespace = %tombstone.namespace,
                        parent = %tombstone.name,
                        "cascade confirmed"
                    );
                    return None;
                }
                Ok(children) => remaining = children,
                Err(e) => warn!(parent = %tombstone.name, error = %e, "orphan check failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let orphan = OrphanDetected {
            kind: tombstone.kind,
            namespace: tombstone.namespace.clone(),
            parent: tombstone.name.clone(),
            parent_uid: tombstone.uid.clone(),
            children: remaining,
            detected_at: epoch_secs(),
        };
        warn!(
            kind = %orphan.kind,
            namespace = %orphan.namespace,
            parent = %orphan.parent,
            children = ?orphan.children,
            "OrphanDetected: children outlived their parent"
        );
        self.diagnostics.record_orphan(orphan.clone());
        Some(orphan)
    }

    /// Confirm every tombstone received until shutdown. Each tombstone is
    /// checked in its own task so a slow cascade never delays others.
    pub async fn run(
        self,
        mut tombstones: mpsc::UnboundedReceiver<Tombstone>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut checks = JoinSet::new();
        loop {
            tokio::select! {
                received = tombstones.recv() => match received {
                    Some(tombstone) => {
                        let gc = self.clone();
                        checks.spawn(async move {
                            gc.confirm(&tombstone).await;
                        });
                    }
                    None => break,
                },
                Some(_) = checks.join_next(), if !checks.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }
        checks.abort_all();
        info!("garbage collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use keel_core::AppKind;
    use serde_json::json;

    use super::*;

    fn tombstone(uid: &str) -> Tombstone {
        Tombstone {
            kind: AppKind::ConfigMapApp,
            namespace: "default".into(),
            name: "app-a".into(),
            uid: uid.into(),
            mod_revision: 1,
        }
    }

    fn owned_by(uid: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({"metadata": {"ownerReferences": [{"uid": uid}]}})).unwrap()
    }

    #[tokio::test]
    async fn confirms_when_children_are_gone() {
        let ks = Keyspace::open_in_memory().unwrap();
        ks.put("/registry/configmaps/default/unrelated", &owned_by("other")).unwrap();
        let diag = Diagnostics::new();
        let gc = GarbageCollector::new(ks, diag.clone(), Duration::from_millis(200));

        assert!(gc.confirm(&tombstone("uid-a")).await.is_none());
        assert!(diag.orphans().is_empty());
    }

    #[tokio::test]
    async fn waits_for_late_cascade() {
        let ks = Keyspace::open_in_memory().unwrap();
        let key = "/registry/deployments/default/app-a-deployment";
        ks.put(key, &owned_by("uid-a")).unwrap();
        let gc = GarbageCollector::new(ks.clone(), Diagnostics::new(), Duration::from_secs(5));

        let deleter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            ks.delete(key).unwrap();
        });
        assert!(gc.confirm(&tombstone("uid-a")).await.is_none());
        deleter.await.unwrap();
    }

    #[tokio::test]
    async fn reports_orphans_after_grace() {
        let ks = Keyspace::open_in_memory().unwrap();
        let key = "/registry/configmaps/default/app-a-configmap";
        ks.put(key, &owned_by("uid-a")).unwrap();
        let diag = Diagnostics::new();
        let gc = GarbageCollector::new(ks.clone(), diag.clone(), Duration::from_millis(150));

        let orphan = gc.confirm(&tombstone("uid-a")).await.unwrap();
        assert_eq!(orphan.children, vec![key.to_string()]);
        assert_eq!(diag.orphans().len(), 1);
        // Never deletes.
        assert!(ks.get(key).unwrap().is_some());
    }
}

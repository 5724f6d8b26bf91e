//! Owner collector — cascading delete by owner reference.
//!
//! Plays the role of the host platform's garbage collector: when a record
//! is deleted, every record listing it in `metadata.ownerReferences` is
//! deleted too. Dependents are matched by owner UID, so a parent recreated
//! under the same name never adopts (or loses) the previous parent's
//! children. A record written with owner references none of which is
//! live is collected as soon as the write is seen, so a dependent created
//! after its owner's deletion does not outlive it. A full sweep on startup
//! and after every watch interruption catches deletions the collector did
//! not observe live.

use std::collections::HashSet;
use std::time::Duration;

use keel_core::objects::{owner_uids, resolve_uid};
use keel_core::{ChangeEvent, KeyValue, REGISTRY_ROOT, Revision};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::keyspace::Keyspace;

/// Pause before reopening an interrupted watch.
const REOPEN_DELAY: Duration = Duration::from_millis(200);

pub struct OwnerCollector {
    keyspace: Keyspace,
}

impl OwnerCollector {
    pub fn new(keyspace: Keyspace) -> Self {
        Self { keyspace }
    }

    /// Delete every record owned by `owner_uid`. Returns the deleted keys.
    pub fn collect_dependents(&self, owner_uid: &str) -> StateResult<Vec<String>> {
        let snapshot = self.keyspace.list(REGISTRY_ROOT)?;
        let doomed: Vec<KeyValue> = snapshot
            .items
            .into_iter()
            .filter(|kv| owner_uids(&kv.value).iter().any(|uid| uid == owner_uid))
            .collect();
        self.delete_all(doomed)
    }

    /// Delete every record whose owners are all gone.
    pub fn sweep(&self) -> StateResult<Vec<String>> {
        let snapshot = self.keyspace.list(REGISTRY_ROOT)?;
        let live = live_uids(&snapshot.items);
        let doomed: Vec<KeyValue> = snapshot
            .items
            .into_iter()
            .filter(|kv| {
                let owners = owner_uids(&kv.value);
                !owners.is_empty() && owners.iter().all(|uid| !live.contains(uid))
            })
            .collect();
        self.delete_all(doomed)
    }

    /// Delete `key` at `mod_revision` if it names owners and none of them
    /// is live. Returns whether it was deleted.
    pub fn collect_if_orphaned(
        &self,
        key: &str,
        value: &[u8],
        mod_revision: Revision,
    ) -> StateResult<bool> {
        let owners = owner_uids(value);
        if owners.is_empty() {
            return Ok(false);
        }
        let live = live_uids(&self.keyspace.list(REGISTRY_ROOT)?.items);
        if owners.iter().any(|uid| live.contains(uid)) {
            return Ok(false);
        }
        match self.keyspace.delete_at(key, mod_revision) {
            Ok(_) => Ok(true),
            Err(StateError::Conflict { .. }) | Err(StateError::NotFound(_)) => {
                debug!(%key, "dependent changed before collection, skipping");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn delete_all(&self, doomed: Vec<KeyValue>) -> StateResult<Vec<String>> {
        let mut deleted = Vec::new();
        for kv in doomed {
            // Conditional on the listed version: a dependent rewritten in
            // the meantime may have been adopted by a new owner.
            match self.keyspace.delete_at(&kv.key, kv.mod_revision) {
                Ok(_) => deleted.push(kv.key),
                Err(StateError::Conflict { .. }) | Err(StateError::NotFound(_)) => {
                    debug!(key = %kv.key, "dependent changed before collection, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Follow deletions until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("owner collector started");
        let mut resume = None;

        loop {
            if resume.is_none() {
                match self.sweep() {
                    Ok(swept) if !swept.is_empty() => {
                        info!(count = swept.len(), "swept orphaned dependents");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "owner sweep failed"),
                }
            }

            let start = match resume {
                Some(revision) => revision,
                None => match self.keyspace.current_revision() {
                    Ok(current) => current + 1,
                    Err(e) => {
                        warn!(error = %e, "owner collector cannot read revision");
                        if wait_or_shutdown(&mut shutdown, REOPEN_DELAY).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let mut stream = match self.keyspace.watch(REGISTRY_ROOT, start) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, start, "owner collector watch failed, resweeping");
                    resume = None;
                    if wait_or_shutdown(&mut shutdown, REOPEN_DELAY).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Ok(event) => {
                            resume = Some(event.mod_revision + 1);
                            if let Err(e) = self.handle(&event) {
                                warn!(key = %event.key, error = %e, "cascading delete failed");
                                resume = None;
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "owner collector watch interrupted");
                            resume = None;
                            break;
                        }
                    },
                    _ = shutdown.changed() => {
                        info!("owner collector shutting down");
                        return;
                    }
                }
            }

            if wait_or_shutdown(&mut shutdown, REOPEN_DELAY).await {
                break;
            }
        }
    }
}

impl OwnerCollector {
    fn handle(&self, event: &ChangeEvent) -> StateResult<()> {
        if !event.is_delete() {
            if let Some(value) = &event.value {
                if self.collect_if_orphaned(&event.key, value, event.mod_revision)? {
                    info!(key = %event.key, "collected dependent written after its owner was deleted");
                }
            }
            return Ok(());
        }
        let uid = resolve_uid(&event.key, event.create_revision, event.prev_value.as_deref());
        let deleted = self.collect_dependents(&uid)?;
        if !deleted.is_empty() {
            info!(owner = %event.key, count = deleted.len(), "cascaded delete to dependents");
        }
        Ok(())
    }
}

fn live_uids(items: &[KeyValue]) -> HashSet<String> {
    items
        .iter()
        .map(|kv| resolve_uid(&kv.key, kv.create_revision, Some(kv.value.as_slice())))
        .collect()
}

/// Sleep for `delay`; returns true if shutdown was signalled instead.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(uid: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "metadata": {"name": "app-a", "uid": uid},
            "spec": {"image": "nginx"}
        }))
        .unwrap()
    }

    fn child(owner_uid: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "metadata": {
                "name": "app-a-configmap",
                "ownerReferences": [{"apiVersion": "demo.mycompany.com/v1", "kind": "ConfigMapApp", "name": "app-a", "uid": owner_uid}]
            },
            "data": {}
        }))
        .unwrap()
    }

    const PARENT: &str = "/registry/demo.mycompany.com/configmapapps/default/app-a";
    const CHILD: &str = "/registry/configmaps/default/app-a-configmap";
    const OTHER: &str = "/registry/configmaps/default/app-b-configmap";

    #[test]
    fn collects_only_matching_dependents() {
        let ks = Keyspace::open_in_memory().unwrap();
        ks.put(PARENT, &parent("u1")).unwrap();
        ks.put(CHILD, &child("u1")).unwrap();
        ks.put(OTHER, &child("u2")).unwrap();

        let collector = OwnerCollector::new(ks.clone());
        let deleted = collector.collect_dependents("u1").unwrap();
        assert_eq!(deleted, vec![CHILD.to_string()]);
        assert!(ks.get(OTHER).unwrap().is_some());
    }

    #[test]
    fn sweep_removes_records_with_dead_owners() {
        let ks = Keyspace::open_in_memory().unwrap();
        ks.put(PARENT, &parent("u1")).unwrap();
        ks.put(CHILD, &child("u1")).unwrap();
        ks.put(OTHER, &child("gone")).unwrap();
        ks.put("/registry/plain/x", b"not json").unwrap();

        let collector = OwnerCollector::new(ks.clone());
        assert_eq!(collector.sweep().unwrap(), vec![OTHER.to_string()]);
        assert!(ks.get(CHILD).unwrap().is_some());
        assert!(ks.get("/registry/plain/x").unwrap().is_some());
    }

    #[tokio::test]
    async fn run_cascades_parent_deletion() {
        let ks = Keyspace::open_in_memory().unwrap();
        ks.put(PARENT, &parent("u1")).unwrap();
        ks.put(CHILD, &child("u1")).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let collector = OwnerCollector::new(ks.clone());
        let handle = tokio::spawn(async move { collector.run(shutdown_rx).await });

        // Let the collector open its watch.
        tokio::time::sleep(Duration::from_millis(50)).await;
        ks.delete(PARENT).unwrap();

        let mut remaining = true;
        for _ in 0..50 {
            if ks.get(CHILD).unwrap().is_none() {
                remaining = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!remaining, "child should be collected");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn dependent_with_dead_owner_is_collected_on_write() {
        let ks = Keyspace::open_in_memory().unwrap();
        ks.put(PARENT, &parent("u1")).unwrap();
        let collector = OwnerCollector::new(ks.clone());

        let kept = ks.put(CHILD, &child("u1")).unwrap();
        assert!(!collector.collect_if_orphaned(CHILD, &child("u1"), kept).unwrap());

        let orphan = ks.put(OTHER, &child("gone")).unwrap();
        assert!(collector.collect_if_orphaned(OTHER, &child("gone"), orphan).unwrap());
        assert!(ks.get(OTHER).unwrap().is_none());
        assert!(ks.get(CHILD).unwrap().is_some());

        assert!(!collector.collect_if_orphaned("/registry/plain/x", b"{}", 1).unwrap());
    }

    #[tokio::test]
    async fn run_collects_dependent_written_after_owner_deletion() {
        let ks = Keyspace::open_in_memory().unwrap();
        ks.put(PARENT, &parent("u1")).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let collector = OwnerCollector::new(ks.clone());
        let handle = tokio::spawn(async move { collector.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A late writer recreates the child after the parent is gone.
        ks.delete(PARENT).unwrap();
        ks.put(CHILD, &child("u1")).unwrap();

        let mut remaining = true;
        for _ in 0..50 {
            if ks.get(CHILD).unwrap().is_none() {
                remaining = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!remaining, "late dependent should be collected");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

//! Child-resource manager — keeps the config and workload objects of a
//! parent in line with its spec.
//!
//! The controller owns a fixed set of paths in each child document
//! (identity, labels, owner references, and `data` or `spec`). Desired
//! content replaces those paths wholesale and leaves every other field as
//! found, so fields added by other writers survive a reconcile. A child is
//! written only when that merge changes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use keel_core::objects::{config_object, resolve_uid, workload_object};
use keel_core::{
    ChildKind, ChildResourceDescriptor, CustomResourceState, ObservedChild, Revision,
};
use keel_state::Keyspace;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::conflict::{ConflictResolver, WriteOutcome};
use crate::error::ReconcileResult;

const METADATA_PATHS: [&[&str]; 6] = [
    &["apiVersion"],
    &["kind"],
    &["metadata", "name"],
    &["metadata", "namespace"],
    &["metadata", "labels"],
    &["metadata", "ownerReferences"],
];

/// Paths of a child document the controller owns.
fn owned_paths(kind: ChildKind) -> impl Iterator<Item = &'static [&'static str]> {
    let body: &'static [&'static str] = match kind {
        ChildKind::ConfigObject => &["data"],
        ChildKind::WorkloadObject => &["spec"],
    };
    METADATA_PATHS.into_iter().chain(std::iter::once(body))
}

fn lookup<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |node, segment| node.get(*segment))
}

fn set_path(doc: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut node = doc;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), value);
    }
}

fn remove_path(doc: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut node = doc;
    for segment in parents {
        match node.get_mut(*segment) {
            Some(next) => node = next,
            None => return,
        }
    }
    if let Value::Object(map) = node {
        map.remove(*last);
    }
}

/// Overlay the owned paths of `desired` onto `current`.
pub fn merge(kind: ChildKind, desired: &Value, current: Option<&Value>) -> Value {
    let mut merged = match current {
        Some(current @ Value::Object(_)) => current.clone(),
        _ => return desired.clone(),
    };
    for path in owned_paths(kind) {
        match lookup(desired, path) {
            Some(value) => set_path(&mut merged, path, value.clone()),
            None => remove_path(&mut merged, path),
        }
    }
    merged
}

/// Outcome of applying one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { resource_version: Revision },
    Unchanged,
}

#[derive(Clone)]
pub struct ChildResourceManager {
    keyspace: Keyspace,
    resolver: ConflictResolver,
    max_attempts: u32,
    /// Last content written or read per child key, by resourceVersion.
    observed: Arc<Mutex<HashMap<String, ObservedChild>>>,
}

impl ChildResourceManager {
    pub fn new(keyspace: Keyspace, max_attempts: u32) -> Self {
        Self {
            resolver: ConflictResolver::new(keyspace.clone()),
            keyspace,
            max_attempts,
            observed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cached(&self, key: &str) -> Option<ObservedChild> {
        let cache = self.observed.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(key).cloned()
    }

    fn remember(&self, key: &str, observed: Option<ObservedChild>) {
        let mut cache = self.observed.lock().unwrap_or_else(|e| e.into_inner());
        match observed {
            Some(observed) => {
                cache.insert(key.to_string(), observed);
            }
            None => {
                cache.remove(key);
            }
        }
    }

    /// Current content of a child. The cached copy is reused while its
    /// resourceVersion still matches the store.
    fn observe(&self, key: &str) -> ReconcileResult<Option<ObservedChild>> {
        let Some(kv) = self.keyspace.get(key)? else {
            self.remember(key, None);
            return Ok(None);
        };
        if let Some(cached) = self.cached(key) {
            if cached.resource_version == kv.mod_revision {
                return Ok(Some(cached));
            }
        }
        let content = match serde_json::from_slice(&kv.value) {
            Ok(content) => content,
            Err(e) => {
                warn!(%key, resource_version = kv.mod_revision, error = %e, "child is not a JSON document, it will be replaced");
                Value::Null
            }
        };
        let observed = ObservedChild {
            content,
            resource_version: kv.mod_revision,
        };
        self.remember(key, Some(observed.clone()));
        Ok(Some(observed))
    }

    /// Whether the parent record still is the one `state` was read from,
    /// with nothing newer written to it since `revision`. A pass for a
    /// parent that vanished, was recreated or moved on writes nothing.
    pub fn parent_is_current(
        &self,
        state: &CustomResourceState,
        revision: Revision,
    ) -> ReconcileResult<bool> {
        let key = state.key();
        let Some(kv) = self.keyspace.get(&key)? else {
            debug!(%key, revision, "parent is gone");
            return Ok(false);
        };
        let uid = resolve_uid(&key, kv.create_revision, Some(kv.value.as_slice()));
        if uid != state.uid {
            debug!(%key, revision, live_uid = %uid, "parent was recreated");
            return Ok(false);
        }
        if kv.mod_revision > revision {
            debug!(%key, revision, live_revision = kv.mod_revision, "parent has a newer revision");
            return Ok(false);
        }
        Ok(true)
    }

    /// Children a parent should have, each with its observed content.
    pub fn descriptors(
        &self,
        state: &CustomResourceState,
    ) -> ReconcileResult<Vec<ChildResourceDescriptor>> {
        let mut descriptors = Vec::new();
        for kind in state.kind.child_kinds() {
            let desired = match kind {
                ChildKind::ConfigObject => serde_json::to_value(config_object(state))?,
                ChildKind::WorkloadObject => serde_json::to_value(workload_object(state))?,
            };
            let name = kind.child_name(&state.name);
            let key = kind.key(&state.namespace, &name);
            descriptors.push(ChildResourceDescriptor {
                kind: *kind,
                namespace: state.namespace.clone(),
                name,
                owner: state.owner_ref(),
                desired,
                observed: self.observe(&key)?,
            });
        }
        Ok(descriptors)
    }

    /// Whether applying the descriptor would change the stored child.
    pub fn differs(descriptor: &ChildResourceDescriptor) -> bool {
        match &descriptor.observed {
            Some(observed) => {
                merge(descriptor.kind, &descriptor.desired, Some(&observed.content))
                    != observed.content
            }
            None => true,
        }
    }

    /// Create or update one child.
    pub fn apply(&self, descriptor: &ChildResourceDescriptor) -> ReconcileResult<ApplyOutcome> {
        if !Self::differs(descriptor) {
            return Ok(ApplyOutcome::Unchanged);
        }

        let key = descriptor.key();
        let outcome = self.resolver.write_with_retry(
            &key,
            descriptor.observed.as_ref(),
            self.max_attempts,
            |current| {
                let merged = merge(descriptor.kind, &descriptor.desired, current);
                (Some(&merged) != current).then_some(merged)
            },
        );

        match outcome {
            Ok(WriteOutcome::Written {
                resource_version,
                content,
                created,
            }) => {
                self.remember(
                    &key,
                    Some(ObservedChild {
                        content,
                        resource_version,
                    }),
                );
                let (reason, verb) = if created {
                    ("Created", "created")
                } else {
                    ("Updated", "updated")
                };
                info!(
                    reason,
                    owner = %descriptor.owner.name,
                    namespace = %descriptor.namespace,
                    resource_version,
                    "{} {} {verb}",
                    descriptor.kind.object_kind(),
                    descriptor.name,
                );
                Ok(ApplyOutcome::Applied { resource_version })
            }
            Ok(WriteOutcome::Unchanged) => Ok(ApplyOutcome::Unchanged),
            Err(e) => {
                // The cached copy may be the reason for the failure.
                self.remember(&key, None);
                Err(e)
            }
        }
    }
}

//! Shared types used across keel crates.
//!
//! Keys follow the registry layout `/registry/{resource}/{namespace}/{name}`,
//! so every watched kind and every child kind owns a distinct key prefix.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Global keyspace revision. Incremented on every mutation.
pub type Revision = u64;

/// Root of every key managed by the keyspace.
pub const REGISTRY_ROOT: &str = "/registry/";

/// API group shared by the custom resources.
pub const GROUP: &str = "demo.mycompany.com";

/// API version of the custom resources.
pub const VERSION: &str = "v1";

// ── Change events ──────────────────────────────────────────────────

/// Kind of mutation carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Put,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Put => f.write_str("PUT"),
            EventType::Delete => f.write_str("DELETE"),
        }
    }
}

/// A single mutation of one key, as delivered by a watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub key: String,
    /// New value. Absent for deletes.
    pub value: Option<Vec<u8>>,
    /// Value before the mutation, if the key existed.
    pub prev_value: Option<Vec<u8>>,
    /// Revision at which the key was (last) created.
    pub create_revision: Revision,
    /// Global revision of this mutation.
    pub mod_revision: Revision,
    /// Per-key mutation counter; restarts at 1 after delete + recreate.
    pub version: u64,
}

impl ChangeEvent {
    pub fn is_delete(&self) -> bool {
        self.event_type == EventType::Delete
    }
}

/// A live key with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub version: u64,
}

impl KeyValue {
    /// The optimistic-concurrency token for this key.
    pub fn resource_version(&self) -> Revision {
        self.mod_revision
    }
}

// ── Checkpoints ────────────────────────────────────────────────────

/// Last fully processed revision for one watched prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub watched_prefix: String,
    pub last_processed_revision: Revision,
}

// ── Parent kinds ───────────────────────────────────────────────────

/// Custom resource kinds a controller can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AppKind {
    /// Workload plus a mounted config object.
    #[serde(rename = "configmapapps")]
    ConfigMapApp,
    /// Workload only.
    #[serde(rename = "simpleapps")]
    SimpleApp,
}

impl AppKind {
    pub const ALL: [AppKind; 2] = [AppKind::ConfigMapApp, AppKind::SimpleApp];

    /// Plural resource name, as used in URLs and config files.
    pub fn plural(self) -> &'static str {
        match self {
            AppKind::ConfigMapApp => "configmapapps",
            AppKind::SimpleApp => "simpleapps",
        }
    }

    /// The `kind` field written into documents and owner references.
    pub fn kind_name(self) -> &'static str {
        match self {
            AppKind::ConfigMapApp => "ConfigMapApp",
            AppKind::SimpleApp => "SimpleApp",
        }
    }

    pub fn api_version(self) -> String {
        format!("{GROUP}/{VERSION}")
    }

    /// Key prefix watched for this kind.
    pub fn prefix(self) -> String {
        format!("{REGISTRY_ROOT}{GROUP}/{}/", self.plural())
    }

    /// Key of one parent record.
    pub fn key(self, namespace: &str, name: &str) -> String {
        format!("{}{namespace}/{name}", self.prefix())
    }

    /// Split a parent key into `(namespace, name)`.
    pub fn parse_key(self, key: &str) -> Option<(String, String)> {
        let rest = key.strip_prefix(&self.prefix())?;
        let (namespace, name) = rest.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some((namespace.to_string(), name.to_string()))
    }

    /// Child objects maintained for a parent of this kind.
    pub fn child_kinds(self) -> &'static [ChildKind] {
        match self {
            AppKind::ConfigMapApp => &[ChildKind::ConfigObject, ChildKind::WorkloadObject],
            AppKind::SimpleApp => &[ChildKind::WorkloadObject],
        }
    }

    /// Whether the workload mounts the config object.
    pub fn mounts_config(self) -> bool {
        matches!(self, AppKind::ConfigMapApp)
    }
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

/// Returned when a kind name is not one of [`AppKind::ALL`].
#[derive(Debug, Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for AppKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppKind::ALL
            .into_iter()
            .find(|k| k.plural() == s || k.kind_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

// ── Child kinds ────────────────────────────────────────────────────

/// Dependent objects owned by a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildKind {
    ConfigObject,
    WorkloadObject,
}

impl ChildKind {
    pub const ALL: [ChildKind; 2] = [ChildKind::ConfigObject, ChildKind::WorkloadObject];

    /// Fixed suffix appended to the parent name.
    pub fn suffix(self) -> &'static str {
        match self {
            ChildKind::ConfigObject => "-configmap",
            ChildKind::WorkloadObject => "-deployment",
        }
    }

    /// Deterministic child name for a parent.
    pub fn child_name(self, parent: &str) -> String {
        format!("{parent}{}", self.suffix())
    }

    pub fn prefix(self) -> String {
        match self {
            ChildKind::ConfigObject => format!("{REGISTRY_ROOT}configmaps/"),
            ChildKind::WorkloadObject => format!("{REGISTRY_ROOT}deployments/"),
        }
    }

    pub fn key(self, namespace: &str, name: &str) -> String {
        format!("{}{namespace}/{name}", self.prefix())
    }

    /// Human-readable object kind, used in event records.
    pub fn object_kind(self) -> &'static str {
        match self {
            ChildKind::ConfigObject => "ConfigMap",
            ChildKind::WorkloadObject => "Deployment",
        }
    }
}

// ── Desired state ──────────────────────────────────────────────────

fn default_replicas() -> u32 {
    1
}

/// The user-declared part of a parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub config_data: BTreeMap<String, String>,
}

/// A decoded parent record at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomResourceState {
    pub kind: AppKind,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub generation: u64,
    pub resource_version: Revision,
    pub spec: AppSpec,
    pub observed_mod_revision: Revision,
}

impl CustomResourceState {
    pub fn key(&self) -> String {
        self.kind.key(&self.namespace, &self.name)
    }

    /// Owner link stamped onto every child of this parent.
    pub fn owner_ref(&self) -> OwnerRef {
        OwnerRef {
            api_version: self.kind.api_version(),
            kind: self.kind.kind_name().to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: true,
            block_owner_deletion: true,
        }
    }
}

/// A deleted parent. Carries no spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub kind: AppKind,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub mod_revision: Revision,
}

/// Back-reference from a child to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

// ── Child descriptors ──────────────────────────────────────────────

/// Last content seen for a child, with its resourceVersion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedChild {
    pub content: serde_json::Value,
    pub resource_version: Revision,
}

/// One child object the reconciler wants to exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildResourceDescriptor {
    pub kind: ChildKind,
    pub namespace: String,
    pub name: String,
    pub owner: OwnerRef,
    pub desired: serde_json::Value,
    pub observed: Option<ObservedChild>,
}

impl ChildResourceDescriptor {
    pub fn key(&self) -> String {
        self.kind.key(&self.namespace, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_keys_and_parsing() {
        let key = AppKind::ConfigMapApp.key("default", "app-a");
        assert_eq!(key, "/registry/demo.mycompany.com/configmapapps/default/app-a");
        assert_eq!(
            AppKind::ConfigMapApp.parse_key(&key),
            Some(("default".to_string(), "app-a".to_string()))
        );
        assert_eq!(AppKind::SimpleApp.parse_key(&key), None);
        assert_eq!(
            AppKind::ConfigMapApp.parse_key("/registry/demo.mycompany.com/configmapapps/default/"),
            None
        );
    }

    #[test]
    fn kind_from_str_accepts_plural_and_kind_name() {
        assert_eq!("configmapapps".parse::<AppKind>().unwrap(), AppKind::ConfigMapApp);
        assert_eq!("SimpleApp".parse::<AppKind>().unwrap(), AppKind::SimpleApp);
        assert!("deployments".parse::<AppKind>().is_err());
    }

    #[test]
    fn child_names_are_deterministic() {
        assert_eq!(ChildKind::ConfigObject.child_name("app-a"), "app-a-configmap");
        assert_eq!(ChildKind::WorkloadObject.child_name("app-a"), "app-a-deployment");
        assert_eq!(
            ChildKind::WorkloadObject.key("ns", "app-a-deployment"),
            "/registry/deployments/ns/app-a-deployment"
        );
    }

    #[test]
    fn simple_apps_have_no_config_child() {
        assert_eq!(AppKind::SimpleApp.child_kinds(), &[ChildKind::WorkloadObject]);
        assert!(!AppKind::SimpleApp.mounts_config());
    }

    #[test]
    fn spec_defaults_match_operator_defaults() {
        let spec: AppSpec = serde_json::from_str(r#"{"image":"nginx"}"#).unwrap();
        assert_eq!(spec.replicas, 1);
        assert!(spec.config_data.is_empty());
    }

    #[test]
    fn event_type_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&EventType::Delete).unwrap(), "\"DELETE\"");
    }
}

//! Document shapes stored in the keyspace.
//!
//! Parents and children are JSON documents shaped like their Kubernetes
//! counterparts (`metadata`, `spec`, `data`). Only the fields the controller
//! reads or owns are modelled; anything else written by other parties is
//! preserved by the child manager's merge step.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Label key linking children and pods to their parent.
pub const APP_LABEL: &str = "app";

/// Container name used for the single workload container.
pub const CONTAINER_NAME: &str = "app";

/// Volume through which the config object is mounted.
pub const CONFIG_VOLUME: &str = "config-volume";

/// Mount path of the config volume inside the container.
pub const CONFIG_MOUNT_PATH: &str = "/etc/config";

fn default_namespace() -> String {
    "default".to_string()
}

/// Object metadata common to parents and children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerRef>,
}

impl Default for ObjectMeta {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: default_namespace(),
            uid: None,
            generation: None,
            labels: BTreeMap::new(),
            owner_references: Vec::new(),
        }
    }
}

// ── Parent ─────────────────────────────────────────────────────────

/// A parent custom resource as written by users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: AppSpec,
}

// ── Config object ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapObject {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

// ── Workload object ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentObject {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: WorkloadSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub replicas: u32,
    pub selector: LabelSelector,
    pub template: PodTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplate {
    pub metadata: TemplateMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMeta {
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub config_map: ConfigMapVolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMapVolumeSource {
    pub name: String,
}

// ── Builders ───────────────────────────────────────────────────────

fn app_labels(parent: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), parent.to_string())])
}

fn child_meta(state: &CustomResourceState, kind: ChildKind) -> ObjectMeta {
    ObjectMeta {
        name: kind.child_name(&state.name),
        namespace: state.namespace.clone(),
        labels: app_labels(&state.name),
        owner_references: vec![state.owner_ref()],
        ..ObjectMeta::default()
    }
}

/// Config object holding every `configData` entry of the parent.
pub fn config_object(state: &CustomResourceState) -> ConfigMapObject {
    ConfigMapObject {
        api_version: "v1".to_string(),
        kind: ChildKind::ConfigObject.object_kind().to_string(),
        metadata: child_meta(state, ChildKind::ConfigObject),
        data: state.spec.config_data.clone(),
    }
}

/// Workload object running the parent's image at the declared replica
/// count. For kinds that carry config, the config object is mounted by name.
pub fn workload_object(state: &CustomResourceState) -> DeploymentObject {
    let (volume_mounts, volumes) = if state.kind.mounts_config() {
        (
            vec![VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
            }],
            vec![Volume {
                name: CONFIG_VOLUME.to_string(),
                config_map: ConfigMapVolumeSource {
                    name: ChildKind::ConfigObject.child_name(&state.name),
                },
            }],
        )
    } else {
        (Vec::new(), Vec::new())
    };

    DeploymentObject {
        api_version: "apps/v1".to_string(),
        kind: ChildKind::WorkloadObject.object_kind().to_string(),
        metadata: child_meta(state, ChildKind::WorkloadObject),
        spec: WorkloadSpec {
            replicas: state.spec.replicas,
            selector: LabelSelector {
                match_labels: app_labels(&state.name),
            },
            template: PodTemplate {
                metadata: TemplateMeta {
                    labels: app_labels(&state.name),
                },
                spec: PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: state.spec.image.clone(),
                        volume_mounts,
                    }],
                    volumes,
                },
            },
        },
    }
}

// ── Owner links ────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct UidOnly {
    #[serde(default)]
    metadata: UidMeta,
}

#[derive(Deserialize, Default)]
struct UidMeta {
    #[serde(default)]
    uid: Option<String>,
}

#[derive(Deserialize, Default)]
struct OwnersOnly {
    #[serde(default)]
    metadata: OwnersMeta,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct OwnersMeta {
    #[serde(default)]
    owner_references: Vec<OwnerUid>,
}

#[derive(Deserialize)]
struct OwnerUid {
    uid: String,
}

/// UID used when a document carries no `metadata.uid`.
///
/// Stable for the lifetime of the key and different after delete + recreate,
/// since the create revision changes.
pub fn derived_uid(key: &str, create_revision: Revision) -> String {
    format!("{key}@{create_revision}")
}

/// UID of a stored document: `metadata.uid` if present, else derived.
pub fn resolve_uid(key: &str, create_revision: Revision, value: Option<&[u8]>) -> String {
    value
        .and_then(|bytes| serde_json::from_slice::<UidOnly>(bytes).ok())
        .and_then(|doc| doc.metadata.uid)
        .filter(|uid| !uid.is_empty())
        .unwrap_or_else(|| derived_uid(key, create_revision))
}

/// Owner UIDs referenced by a stored child document. Undecodable
/// documents have no owners.
pub fn owner_uids(value: &[u8]) -> Vec<String> {
    serde_json::from_slice::<OwnersOnly>(value)
        .map(|doc| {
            doc.metadata
                .owner_references
                .into_iter()
                .map(|owner| owner.uid)
                .collect()
        })
        .unwrap_or_default()
}

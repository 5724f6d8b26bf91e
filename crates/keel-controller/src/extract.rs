//! Desired-state extraction from change events.
//!
//! The key is authoritative for namespace and name; `metadata` in the
//! document is only consulted for the uid and generation.

use keel_core::objects::{ParentDocument, derived_uid, resolve_uid};
use keel_core::{AppKind, ChangeEvent, CustomResourceState, EventType, Tombstone};

use crate::error::{ReconcileError, ReconcileResult};

/// What a parent event asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Desired {
    State(CustomResourceState),
    Tombstone(Tombstone),
}

pub fn extract(kind: AppKind, event: &ChangeEvent) -> ReconcileResult<Desired> {
    let (namespace, name) = kind
        .parse_key(&event.key)
        .ok_or_else(|| ReconcileError::malformed(&event.key, format!("key is not a {kind} key")))?;

    match event.event_type {
        EventType::Delete => Ok(Desired::Tombstone(Tombstone {
            kind,
            namespace,
            name,
            uid: resolve_uid(&event.key, event.create_revision, event.prev_value.as_deref()),
            mod_revision: event.mod_revision,
        })),
        EventType::Put => {
            let value = event
                .value
                .as_deref()
                .ok_or_else(|| ReconcileError::malformed(&event.key, "put without a value"))?;
            let doc: ParentDocument = serde_json::from_slice(value)
                .map_err(|e| ReconcileError::malformed(&event.key, e.to_string()))?;
            if doc.spec.image.trim().is_empty() {
                return Err(ReconcileError::malformed(&event.key, "spec.image is empty"));
            }

            let uid = doc
                .metadata
                .uid
                .filter(|uid| !uid.is_empty())
                .unwrap_or_else(|| derived_uid(&event.key, event.create_revision));

            Ok(Desired::State(CustomResourceState {
                kind,
                namespace,
                name,
                uid,
                generation: doc.metadata.generation.unwrap_or(event.version),
                resource_version: event.mod_revision,
                spec: doc.spec,
                observed_mod_revision: event.mod_revision,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(kind: AppKind, name: &str, body: &str) -> ChangeEvent {
        ChangeEvent {
            event_type: EventType::Put,
            key: kind.key("default", name),
            value: Some(body.as_bytes().to_vec()),
            prev_value: None,
            create_revision: 7,
            mod_revision: 9,
            version: 2,
        }
    }

    #[test]
    fn put_decodes_spec_with_defaults() {
        let event = put(AppKind::ConfigMapApp, "app-a", r#"{"spec":{"image":"nginx"}}"#);
        let Desired::State(state) = extract(AppKind::ConfigMapApp, &event).unwrap() else {
            panic!("expected state");
        };
        assert_eq!(state.name, "app-a");
        assert_eq!(state.namespace, "default");
        assert_eq!(state.spec.replicas, 1);
        assert!(state.spec.config_data.is_empty());
        assert_eq!(state.uid, derived_uid(&event.key, 7));
        assert_eq!(state.generation, 2);
        assert_eq!(state.resource_version, 9);
    }

    #[test]
    fn key_wins_over_metadata() {
        let event = put(
            AppKind::SimpleApp,
            "app-a",
            r#"{"metadata":{"name":"other","namespace":"elsewhere","uid":"u-1","generation":4},"spec":{"image":"nginx","replicas":3}}"#,
        );
        let Desired::State(state) = extract(AppKind::SimpleApp, &event).unwrap() else {
            panic!("expected state");
        };
        assert_eq!(state.name, "app-a");
        assert_eq!(state.namespace, "default");
        assert_eq!(state.uid, "u-1");
        assert_eq!(state.generation, 4);
        assert_eq!(state.spec.replicas, 3);
    }

    #[test]
    fn undecodable_documents_are_malformed() {
        for body in [
            "not json",
            r#"{"spec":{}}"#,
            r#"{"spec":{"image":""}}"#,
            r#"{"spec":{"image":"nginx","replicas":"three"}}"#,
        ] {
            let event = put(AppKind::SimpleApp, "app-a", body);
            let err = extract(AppKind::SimpleApp, &event).unwrap_err();
            assert!(err.is_malformed(), "{body} should be malformed");
        }
    }

    #[test]
    fn foreign_key_is_malformed() {
        let event = put(AppKind::SimpleApp, "app-a", r#"{"spec":{"image":"nginx"}}"#);
        assert!(extract(AppKind::ConfigMapApp, &event).unwrap_err().is_malformed());
    }

    #[test]
    fn delete_yields_tombstone_with_previous_uid() {
        let event = ChangeEvent {
            event_type: EventType::Delete,
            key: AppKind::ConfigMapApp.key("team", "app-a"),
            value: None,
            prev_value: Some(br#"{"metadata":{"uid":"u-9"},"spec":{"image":"x"}}"#.to_vec()),
            create_revision: 3,
            mod_revision: 12,
            version: 0,
        };
        let Desired::Tombstone(tombstone) = extract(AppKind::ConfigMapApp, &event).unwrap() else {
            panic!("expected tombstone");
        };
        assert_eq!(tombstone.namespace, "team");
        assert_eq!(tombstone.name, "app-a");
        assert_eq!(tombstone.uid, "u-9");
        assert_eq!(tombstone.mod_revision, 12);
    }
}

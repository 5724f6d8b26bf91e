//! Handler table — `(kind, event type) → handler`, built once per
//! controller and consulted for every event.

use std::collections::HashMap;

use keel_core::{AppKind, ChangeEvent, EventType};
use tracing::debug;

use crate::children::{ApplyOutcome, ChildResourceManager};
use crate::diagnostics::{Diagnostics, ReconcilePhase};
use crate::error::{ReconcileError, ReconcileResult};
use crate::extract::{Desired, extract};
use crate::gc::TombstoneSender;

/// Everything a handler needs to run one pass for one kind.
pub struct ReconcileContext {
    pub kind: AppKind,
    pub children: ChildResourceManager,
    pub tombstones: TombstoneSender,
    pub diagnostics: Diagnostics,
}

impl ReconcileContext {
    fn phase(&self, event: &ChangeEvent, phase: ReconcilePhase) {
        self.diagnostics
            .set_phase(self.kind, &event.key, phase, event.mod_revision);
    }
}

/// What a successful pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Reconciled { applied: usize, unchanged: usize },
    /// The parent was deleted, recreated or rewritten after the event.
    /// Nothing was written; a later event carries the live state.
    Superseded,
    Tombstoned,
}

pub type Handler = fn(&ReconcileContext, &ChangeEvent) -> ReconcileResult<PassOutcome>;

#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<(AppKind, EventType), Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: AppKind, event_type: EventType, handler: Handler) -> Self {
        self.handlers.insert((kind, event_type), handler);
        self
    }

    /// PUT reconciles children, DELETE hands a tombstone to the garbage
    /// collector, for every given kind.
    pub fn standard(kinds: &[AppKind]) -> Self {
        kinds.iter().fold(Self::new(), |table, kind| {
            table
                .register(*kind, EventType::Put, reconcile_children)
                .register(*kind, EventType::Delete, forward_tombstone)
        })
    }

    pub fn handler(&self, kind: AppKind, event_type: EventType) -> Option<Handler> {
        self.handlers.get(&(kind, event_type)).copied()
    }

    pub fn dispatch(
        &self,
        ctx: &ReconcileContext,
        event: &ChangeEvent,
    ) -> ReconcileResult<PassOutcome> {
        let handler = self.handler(ctx.kind, event.event_type).ok_or_else(|| {
            ReconcileError::malformed(
                &event.key,
                format!("no handler for {} {}", ctx.kind, event.event_type),
            )
        })?;
        handler(ctx, event)
    }
}

fn reconcile_children(ctx: &ReconcileContext, event: &ChangeEvent) -> ReconcileResult<PassOutcome> {
    ctx.phase(event, ReconcilePhase::Extracting);
    let state = match extract(ctx.kind, event)? {
        Desired::State(state) => state,
        Desired::Tombstone(_) => {
            return Err(ReconcileError::malformed(&event.key, "put decoded as a tombstone"));
        }
    };

    ctx.phase(event, ReconcilePhase::Diffing);
    if !ctx.children.parent_is_current(&state, event.mod_revision)? {
        debug!(
            kind = %ctx.kind,
            key = %event.key,
            revision = event.mod_revision,
            "parent moved on, skipping pass"
        );
        return Ok(PassOutcome::Superseded);
    }
    let descriptors = ctx.children.descriptors(&state)?;
    let pending: Vec<_> = descriptors
        .iter()
        .filter(|d| ChildResourceManager::differs(d))
        .collect();
    let unchanged = descriptors.len() - pending.len();

    ctx.phase(event, ReconcilePhase::Applying);
    let mut applied = 0;
    for descriptor in pending {
        match ctx.children.apply(descriptor)? {
            ApplyOutcome::Applied { .. } => applied += 1,
            ApplyOutcome::Unchanged => {}
        }
    }

    debug!(
        kind = %ctx.kind,
        key = %event.key,
        generation = state.generation,
        applied,
        unchanged,
        "children reconciled"
    );
    Ok(PassOutcome::Reconciled { applied, unchanged })
}

fn forward_tombstone(ctx: &ReconcileContext, event: &ChangeEvent) -> ReconcileResult<PassOutcome> {
    ctx.phase(event, ReconcilePhase::Extracting);
    match extract(ctx.kind, event)? {
        Desired::Tombstone(tombstone) => {
            if ctx.tombstones.send(tombstone).is_err() {
                debug!(key = %event.key, "garbage collector stopped, tombstone dropped");
            }
            Ok(PassOutcome::Tombstoned)
        }
        Desired::State(_) => Err(ReconcileError::malformed(
            &event.key,
            "delete decoded as a state",
        )),
    }
}

#[cfg(test)]
mod tests {
    use keel_state::Keyspace;
    use tokio::sync::mpsc;

    use super::*;

    fn context(kind: AppKind) -> (ReconcileContext, mpsc::UnboundedReceiver<keel_core::Tombstone>, Keyspace) {
        let ks = Keyspace::open_in_memory().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = ReconcileContext {
            kind,
            children: ChildResourceManager::new(ks.clone(), 3),
            tombstones: tx,
            diagnostics: Diagnostics::new(),
        };
        (ctx, rx, ks)
    }

    fn put_event(ks: &Keyspace, kind: AppKind, body: &str) -> ChangeEvent {
        let key = kind.key("default", "app-a");
        let revision = ks.put(&key, body.as_bytes()).unwrap();
        ChangeEvent {
            event_type: EventType::Put,
            key,
            value: Some(body.as_bytes().to_vec()),
            prev_value: None,
            create_revision: revision,
            mod_revision: revision,
            version: 1,
        }
    }

    #[test]
    fn standard_table_covers_every_kind_and_event() {
        let table = HandlerTable::standard(&AppKind::ALL);
        for kind in AppKind::ALL {
            assert!(table.handler(kind, EventType::Put).is_some());
            assert!(table.handler(kind, EventType::Delete).is_some());
        }
        let partial = HandlerTable::standard(&[AppKind::SimpleApp]);
        assert!(partial.handler(AppKind::ConfigMapApp, EventType::Put).is_none());
    }

    #[test]
    fn missing_handler_is_malformed() {
        let (ctx, _rx, ks) = context(AppKind::SimpleApp);
        let event = put_event(&ks, AppKind::SimpleApp, r#"{"spec":{"image":"nginx"}}"#);
        let err = HandlerTable::new().dispatch(&ctx, &event).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn put_creates_children() {
        let (ctx, _rx, ks) = context(AppKind::ConfigMapApp);
        let event = put_event(&ks, AppKind::ConfigMapApp, r#"{"spec":{"image":"nginx","replicas":2}}"#);
        let table = HandlerTable::standard(&AppKind::ALL);

        let outcome = table.dispatch(&ctx, &event).unwrap();
        assert_eq!(outcome, PassOutcome::Reconciled { applied: 2, unchanged: 0 });
        let outcome = table.dispatch(&ctx, &event).unwrap();
        assert_eq!(outcome, PassOutcome::Reconciled { applied: 0, unchanged: 2 });
        assert_eq!(ctx.diagnostics.phase(&event.key), Some(ReconcilePhase::Applying));
        assert!(ks.get("/registry/configmaps/default/app-a-configmap").unwrap().is_some());
    }

    #[test]
    fn pass_for_deleted_parent_writes_nothing() {
        let (ctx, _rx, ks) = context(AppKind::SimpleApp);
        let event = put_event(&ks, AppKind::SimpleApp, r#"{"spec":{"image":"nginx"}}"#);
        ks.delete(&event.key).unwrap();
        let revision = ks.current_revision().unwrap();

        let table = HandlerTable::standard(&AppKind::ALL);
        assert_eq!(table.dispatch(&ctx, &event).unwrap(), PassOutcome::Superseded);
        assert_eq!(ks.current_revision().unwrap(), revision);
        assert!(ks.get("/registry/deployments/default/app-a-deployment").unwrap().is_none());
    }

    #[test]
    fn pass_for_recreated_or_rewritten_parent_writes_nothing() {
        let (ctx, _rx, ks) = context(AppKind::SimpleApp);
        let table = HandlerTable::standard(&AppKind::ALL);
        let body = r#"{"spec":{"image":"nginx"}}"#;

        let stale = put_event(&ks, AppKind::SimpleApp, body);
        ks.delete(&stale.key).unwrap();
        // Same name, new create revision, so a new derived uid.
        let recreated = put_event(&ks, AppKind::SimpleApp, body);
        assert_eq!(table.dispatch(&ctx, &stale).unwrap(), PassOutcome::Superseded);

        ks.put(&recreated.key, body.as_bytes()).unwrap();
        assert_eq!(table.dispatch(&ctx, &recreated).unwrap(), PassOutcome::Superseded);
    }

    #[test]
    fn delete_forwards_tombstone() {
        let (ctx, mut rx, ks) = context(AppKind::SimpleApp);
        let put = put_event(&ks, AppKind::SimpleApp, r#"{"spec":{"image":"nginx"}}"#);
        let event = ChangeEvent {
            event_type: EventType::Delete,
            value: None,
            prev_value: put.value.clone(),
            mod_revision: put.mod_revision + 1,
            version: 0,
            ..put
        };
        let table = HandlerTable::standard(&AppKind::ALL);
        assert_eq!(table.dispatch(&ctx, &event).unwrap(), PassOutcome::Tombstoned);
        let tombstone = rx.try_recv().unwrap();
        assert_eq!(tombstone.name, "app-a");
    }
}

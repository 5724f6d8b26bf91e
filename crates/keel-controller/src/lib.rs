//! keel-controller — desired-state reconciliation for parent resources.
//!
//! One [`Controller`] runs per parent kind. It resumes a watch on the kind's
//! prefix from the last checkpoint, reconciles each parent's config and
//! workload children, and advances the checkpoint once a batch commits.
//!
//! # Architecture
//!
//! ```text
//! Controller (per kind)
//!   ├── WatchListener → EventSource   (checkpoint or snapshot)
//!   ├── Reconciler                     (batch, coalesce, worker pool)
//!   │     └── HandlerTable             ((kind, event type) → handler)
//!   │           ├── extract            (event → state | tombstone)
//!   │           └── ChildResourceManager → ConflictResolver → Keyspace
//!   └── GarbageCollector               (confirms cascades, reports orphans)
//! ```
//!
//! Parent deletion is never acted on directly: children carry owner
//! references and are removed by the store's cascading delete.

pub mod backoff;
pub mod children;
pub mod conflict;
pub mod controller;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod gc;
pub mod listener;
pub mod reconciler;

pub use children::{ApplyOutcome, ChildResourceManager};
pub use conflict::{ConflictResolver, WriteOutcome};
pub use controller::Controller;
pub use diagnostics::{Diagnostics, OrphanDetected, PhaseEntry, ReconcilePhase};
pub use dispatch::{HandlerTable, PassOutcome, ReconcileContext};
pub use error::{ReconcileError, ReconcileResult};
pub use extract::{Desired, extract};
pub use gc::GarbageCollector;
pub use listener::{EventSource, StartFrom, WatchListener};
pub use reconciler::{Reconciler, ReconcilerSettings};

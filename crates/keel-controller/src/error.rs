//! Reconciler error types.

use keel_core::Revision;
use keel_state::StateError;
use thiserror::Error;

/// Errors that can occur while reconciling a kind.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The parent document cannot be decoded. Never retried.
    #[error("malformed state at {key}: {reason}")]
    MalformedState { key: String, reason: String },

    /// Transient. Only surfaces when a store call outside the conflict
    /// resolver fails; the resolver retries conflicts itself.
    #[error("resource version conflict on {0}")]
    Conflict(String),

    #[error("gave up on {key} after {attempts} conflicting writes")]
    ConflictExhausted { key: String, attempts: u32 },

    /// Transient, like `Conflict`. The resolver recreates vanished
    /// children instead of returning this.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("revision {requested} is compacted (boundary {compacted})")]
    StaleRevision { requested: Revision, compacted: Revision },

    #[error("watch interrupted: {0}")]
    WatchInterrupted(String),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("state store error: {0}")]
    State(StateError),
}

impl ReconcileError {
    pub fn malformed(key: &str, reason: impl Into<String>) -> Self {
        ReconcileError::MalformedState {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, ReconcileError::MalformedState { .. })
    }

    /// Errors a restart cannot fix. The controller stops on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReconcileError::State(StateError::CorruptCheckpoint { .. })
        )
    }
}

impl From<StateError> for ReconcileError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict { key, .. } => ReconcileError::Conflict(key),
            StateError::NotFound(key) => ReconcileError::NotFound(key),
            StateError::StaleRevision {
                requested,
                compacted,
            } => ReconcileError::StaleRevision {
                requested,
                compacted,
            },
            StateError::WatchClosed(reason) => ReconcileError::WatchInterrupted(reason),
            other => ReconcileError::State(other),
        }
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::Serialize(err.to_string())
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_map_to_typed_variants() {
        let err: ReconcileError = StateError::StaleRevision {
            requested: 100,
            compacted: 500,
        }
        .into();
        assert!(matches!(
            err,
            ReconcileError::StaleRevision { requested: 100, compacted: 500 }
        ));

        let err: ReconcileError = StateError::WatchClosed("lagged".into()).into();
        assert!(matches!(err, ReconcileError::WatchInterrupted(_)));
    }

    #[test]
    fn corrupt_checkpoint_is_fatal() {
        let err: ReconcileError = StateError::CorruptCheckpoint {
            prefix: "/p/".into(),
            reason: "bad".into(),
        }
        .into();
        assert!(err.is_fatal());
        assert!(!ReconcileError::NotFound("k".into()).is_fatal());
    }
}

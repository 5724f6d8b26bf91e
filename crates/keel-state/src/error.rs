//! Error types for the keel keyspace and checkpoint store.

use keel_core::Revision;
use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict on {key}: expected revision {expected:?}, found {actual:?}")]
    Conflict {
        key: String,
        expected: Option<Revision>,
        actual: Option<Revision>,
    },

    #[error("revision {requested} is below the compaction boundary {compacted}")]
    StaleRevision {
        requested: Revision,
        compacted: Revision,
    },

    #[error("watch closed: {0}")]
    WatchClosed(String),

    #[error("corrupt checkpoint for {prefix}: {reason}")]
    CorruptCheckpoint { prefix: String, reason: String },
}

impl StateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}

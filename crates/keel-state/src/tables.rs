//! redb table definitions for the keel keyspace and checkpoint store.
//!
//! Record and history values are JSON-serialized; revisions are plain `u64`.

use redb::TableDefinition;

/// Live records keyed by their full registry key.
pub const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// One change event per global revision, oldest first.
pub const HISTORY: TableDefinition<u64, &[u8]> = TableDefinition::new("history");

/// Keyspace counters (`revision`, `compacted`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Checkpoints keyed by watched prefix.
pub const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

pub const REVISION_KEY: &str = "revision";
pub const COMPACTED_KEY: &str = "compacted";

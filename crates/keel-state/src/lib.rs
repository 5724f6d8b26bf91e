//! keel-state — revisioned keyspace and controller-local state for keel.
//!
//! Backed by [redb](https://docs.rs/redb), provides:
//!
//! - [`Keyspace`]: a key-value store with a global revision counter,
//!   per-key versions, compare-and-swap writes, an ordered event history
//!   with compaction, and resumable prefix watches.
//! - [`CheckpointStore`]: last processed revision per watched prefix.
//! - [`OwnerCollector`]: cascading delete of records whose owner was
//!   deleted.
//!
//! # Architecture
//!
//! All records and history entries are JSON-serialized into redb's `&[u8]`
//! value columns. Keys follow `/registry/{resource}/{namespace}/{name}`, so
//! a watch on a resource prefix sees exactly one kind.
//!
//! `Keyspace` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`) and
//! can be shared across async tasks.

pub mod cascade;
pub mod checkpoint;
pub mod error;
pub mod keyspace;
pub mod tables;
pub mod watch;

pub use cascade::OwnerCollector;
pub use checkpoint::CheckpointStore;
pub use error::{StateError, StateResult};
pub use keyspace::{Keyspace, Snapshot};
pub use watch::WatchStream;

//! Keyspace — a revisioned key-value log backed by redb.
//!
//! Every mutation bumps a single global revision and appends one
//! [`ChangeEvent`] to the history table in the same write transaction, so
//! the history is a gap-free, totally ordered log of the keyspace.
//! Committed events are also fanned out to live watchers over a broadcast
//! channel. Compaction discards history below a boundary; watches that
//! would need discarded history fail with [`StateError::StaleRevision`].

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use keel_core::{ChangeEvent, EventType, KeyValue, Revision};
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::watch::WatchStream;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Live events buffered per watcher before it is considered lagging.
const WATCH_BUFFER: usize = 4096;

/// A record as persisted in the records table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    value: Vec<u8>,
    create_revision: Revision,
    mod_revision: Revision,
    version: u64,
}

impl StoredRecord {
    fn into_key_value(self, key: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: self.value,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
        }
    }
}

enum Mutation {
    Put(Vec<u8>),
    Delete,
}

/// Consistent listing of a prefix at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub revision: Revision,
    pub items: Vec<KeyValue>,
}

/// Thread-safe revisioned keyspace.
#[derive(Clone)]
pub struct Keyspace {
    db: Arc<Database>,
    events: broadcast::Sender<ChangeEvent>,
    /// Serializes commit + broadcast so live events leave in revision order.
    write_gate: Arc<Mutex<()>>,
    /// Bumped to force every open watch closed.
    generation: Arc<watch::Sender<u64>>,
}

fn decode_record(bytes: &[u8]) -> StateResult<StoredRecord> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

pub(crate) fn decode_event(bytes: &[u8]) -> StateResult<ChangeEvent> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

impl Keyspace {
    /// Open (or create) a persistent keyspace at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let keyspace = Self::from_database(db)?;
        debug!(?path, "keyspace opened");
        Ok(keyspace)
    }

    /// Create an ephemeral in-memory keyspace (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let keyspace = Self::from_database(db)?;
        debug!("in-memory keyspace opened");
        Ok(keyspace)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        let (generation, _) = watch::channel(0);
        let keyspace = Self {
            db: Arc::new(db),
            events,
            write_gate: Arc::new(Mutex::new(())),
            generation: Arc::new(generation),
        };
        keyspace.ensure_tables()?;
        Ok(keyspace)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RECORDS).map_err(map_err!(Table))?;
        txn.open_table(HISTORY).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Latest committed global revision (0 before the first write).
    pub fn current_revision(&self) -> StateResult<Revision> {
        self.read_meta(REVISION_KEY)
    }

    /// Oldest revision still present in the history.
    pub fn compaction_boundary(&self) -> StateResult<Revision> {
        self.read_meta(COMPACTED_KEY)
    }

    fn read_meta(&self, key: &str) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        let value = table.get(key).map_err(map_err!(Read))?.map(|g| g.value());
        Ok(value.unwrap_or(0))
    }

    /// Get a live key with its revision metadata.
    pub fn get(&self, key: &str) -> StateResult<Option<KeyValue>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode_record(guard.value())?.into_key_value(key))),
            None => Ok(None),
        }
    }

    /// List every live key under `prefix` at a single revision.
    pub fn list(&self, prefix: &str) -> StateResult<Snapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let revision = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);

        let table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let mut items = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                items.push(decode_record(value.value())?.into_key_value(key.value()));
            }
        }
        Ok(Snapshot { revision, items })
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Unconditionally write a key. Returns the new resourceVersion.
    pub fn put(&self, key: &str, value: &[u8]) -> StateResult<Revision> {
        let event = self.commit(key, |_| Ok(Some(Mutation::Put(value.to_vec()))))?;
        event
            .map(|e| e.mod_revision)
            .ok_or_else(|| StateError::Write(format!("put of {key} produced no revision")))
    }

    /// Write `value` only if the key's resourceVersion still equals
    /// `expected`. `None` means the key must not exist (create).
    ///
    /// Fails with [`StateError::Conflict`] on a version mismatch and with
    /// [`StateError::NotFound`] if an expected key has disappeared.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Revision>,
        value: &[u8],
    ) -> StateResult<Revision> {
        let event = self.commit(key, |current| {
            check_expected(key, expected, current)?;
            Ok(Some(Mutation::Put(value.to_vec())))
        })?;
        event
            .map(|e| e.mod_revision)
            .ok_or_else(|| StateError::Write(format!("swap of {key} produced no revision")))
    }

    /// Delete a key. Returns the deletion revision, or `None` if absent.
    pub fn delete(&self, key: &str) -> StateResult<Option<Revision>> {
        let event = self.commit(key, |current| {
            Ok(current.map(|_| Mutation::Delete))
        })?;
        Ok(event.map(|e| e.mod_revision))
    }

    /// Delete a key only if its resourceVersion still equals `expected`.
    pub fn delete_at(&self, key: &str, expected: Revision) -> StateResult<Revision> {
        let event = self.commit(key, |current| {
            check_expected(key, Some(expected), current)?;
            Ok(Some(Mutation::Delete))
        })?;
        event
            .map(|e| e.mod_revision)
            .ok_or_else(|| StateError::NotFound(key.to_string()))
    }

    /// Apply one mutation atomically: read the current record, let `decide`
    /// pick a mutation, then write the record, the history entry and the
    /// new revision in one transaction before broadcasting the event.
    fn commit<F>(&self, key: &str, decide: F) -> StateResult<Option<ChangeEvent>>
    where
        F: FnOnce(Option<&StoredRecord>) -> StateResult<Option<Mutation>>,
    {
        let _gate = self
            .write_gate
            .lock()
            .map_err(|_| StateError::Transaction("write gate poisoned".to_string()))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let event = {
            let mut records = txn.open_table(RECORDS).map_err(map_err!(Table))?;
            let mut history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;

            let current = match records.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(decode_record(guard.value())?),
                None => None,
            };

            let Some(mutation) = decide(current.as_ref())? else {
                return Ok(None);
            };

            let revision = meta
                .get(REVISION_KEY)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;

            let event = match mutation {
                Mutation::Put(value) => {
                    let (create_revision, version) = match &current {
                        Some(prev) => (prev.create_revision, prev.version + 1),
                        None => (revision, 1),
                    };
                    let record = StoredRecord {
                        value: value.clone(),
                        create_revision,
                        mod_revision: revision,
                        version,
                    };
                    let encoded = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    records
                        .insert(key, encoded.as_slice())
                        .map_err(map_err!(Write))?;
                    ChangeEvent {
                        event_type: EventType::Put,
                        key: key.to_string(),
                        value: Some(value),
                        prev_value: current.map(|prev| prev.value),
                        create_revision,
                        mod_revision: revision,
                        version,
                    }
                }
                Mutation::Delete => {
                    let Some(prev) = current else {
                        return Ok(None);
                    };
                    records.remove(key).map_err(map_err!(Write))?;
                    ChangeEvent {
                        event_type: EventType::Delete,
                        key: key.to_string(),
                        value: None,
                        prev_value: Some(prev.value),
                        create_revision: prev.create_revision,
                        mod_revision: revision,
                        version: 0,
                    }
                }
            };

            let encoded = serde_json::to_vec(&event).map_err(map_err!(Serialize))?;
            history
                .insert(revision, encoded.as_slice())
                .map_err(map_err!(Write))?;
            meta.insert(REVISION_KEY, revision)
                .map_err(map_err!(Write))?;
            event
        };
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(
            key = %event.key,
            revision = event.mod_revision,
            event_type = %event.event_type,
            "keyspace mutation committed"
        );
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(event.clone());
        Ok(Some(event))
    }

    // ── History ────────────────────────────────────────────────────

    /// Discard history below `revision`. Returns the number of events
    /// removed. The boundary never moves backwards or past the current
    /// revision + 1.
    pub fn compact(&self, revision: Revision) -> StateResult<u64> {
        let _gate = self
            .write_gate
            .lock()
            .map_err(|_| StateError::Transaction("write gate poisoned".to_string()))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (removed, boundary) = {
            let mut history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;

            let current = meta
                .get(REVISION_KEY)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            let compacted = meta
                .get(COMPACTED_KEY)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);

            let target = revision.min(current + 1);
            if target <= compacted {
                return Ok(0);
            }

            let doomed: Vec<u64> = history
                .range(..target)
                .map_err(map_err!(Read))?
                .map(|entry| entry.map(|(k, _)| k.value()))
                .collect::<Result<_, _>>()
                .map_err(map_err!(Read))?;
            for rev in &doomed {
                history.remove(*rev).map_err(map_err!(Write))?;
            }
            meta.insert(COMPACTED_KEY, target)
                .map_err(map_err!(Write))?;
            (doomed.len() as u64, target)
        };
        txn.commit().map_err(map_err!(Transaction))?;

        info!(boundary, removed, "keyspace history compacted");
        Ok(removed)
    }

    /// Open a watch on `prefix` delivering every event with
    /// `mod_revision >= start`, first from history and then live.
    pub fn watch(&self, prefix: &str, start: Revision) -> StateResult<WatchStream> {
        let start = start.max(1);
        // Subscribe before reading history so nothing committed in between
        // is missed; duplicates are dropped by the stream's floor.
        let live = self.events.subscribe();
        let generation = self.generation.subscribe();

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let current = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        let compacted = meta
            .get(COMPACTED_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);

        if start < compacted {
            return Err(StateError::StaleRevision {
                requested: start,
                compacted,
            });
        }

        let history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let mut backlog = VecDeque::new();
        for entry in history.range(start..).map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event = decode_event(value.value())?;
            if event.key.starts_with(prefix) {
                backlog.push_back(event);
            }
        }

        debug!(%prefix, start, current, backlog = backlog.len(), "watch opened");
        Ok(WatchStream::new(
            prefix.to_string(),
            backlog,
            live,
            generation,
            (start - 1).max(current),
        ))
    }

    /// Close every open watch, as a server-side disconnect would.
    pub fn disconnect_watchers(&self) {
        self.generation.send_modify(|g| *g += 1);
        info!("all keyspace watchers disconnected");
    }
}

fn check_expected(
    key: &str,
    expected: Option<Revision>,
    current: Option<&StoredRecord>,
) -> StateResult<()> {
    match (expected, current) {
        (None, None) => Ok(()),
        (Some(_), None) => Err(StateError::NotFound(key.to_string())),
        (Some(exp), Some(rec)) if rec.mod_revision == exp => Ok(()),
        (expected, Some(rec)) => Err(StateError::Conflict {
            key: key.to_string(),
            expected,
            actual: Some(rec.mod_revision),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keyspace() -> Keyspace {
        Keyspace::open_in_memory().unwrap()
    }

    // ── Revisions ──────────────────────────────────────────────────

    #[test]
    fn revisions_are_global_and_versions_per_key() {
        let ks = test_keyspace();
        assert_eq!(ks.current_revision().unwrap(), 0);

        assert_eq!(ks.put("/a", b"1").unwrap(), 1);
        assert_eq!(ks.put("/b", b"1").unwrap(), 2);
        assert_eq!(ks.put("/a", b"2").unwrap(), 3);

        let a = ks.get("/a").unwrap().unwrap();
        assert_eq!(a.create_revision, 1);
        assert_eq!(a.mod_revision, 3);
        assert_eq!(a.version, 2);
        assert_eq!(a.value, b"2");
        assert_eq!(ks.current_revision().unwrap(), 3);
    }

    #[test]
    fn version_resets_after_delete_and_recreate() {
        let ks = test_keyspace();
        ks.put("/a", b"1").unwrap();
        ks.put("/a", b"2").unwrap();
        assert_eq!(ks.delete("/a").unwrap(), Some(3));
        ks.put("/a", b"3").unwrap();

        let a = ks.get("/a").unwrap().unwrap();
        assert_eq!(a.version, 1);
        assert_eq!(a.create_revision, 4);
    }

    #[test]
    fn delete_absent_key_is_noop() {
        let ks = test_keyspace();
        assert_eq!(ks.delete("/nope").unwrap(), None);
        assert_eq!(ks.current_revision().unwrap(), 0);
    }

    // ── Compare-and-swap ───────────────────────────────────────────

    #[test]
    fn cas_create_requires_absence() {
        let ks = test_keyspace();
        assert_eq!(ks.compare_and_swap("/a", None, b"x").unwrap(), 1);
        let err = ks.compare_and_swap("/a", None, b"y").unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn cas_update_checks_resource_version() {
        let ks = test_keyspace();
        let rv = ks.put("/a", b"x").unwrap();
        ks.put("/a", b"other writer").unwrap();

        let err = ks.compare_and_swap("/a", Some(rv), b"mine").unwrap_err();
        match err {
            StateError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, Some(rv));
                assert_eq!(actual, Some(2));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let rv = ks.get("/a").unwrap().unwrap().resource_version();
        assert_eq!(ks.compare_and_swap("/a", Some(rv), b"mine").unwrap(), 3);
    }

    #[test]
    fn cas_on_vanished_key_is_not_found() {
        let ks = test_keyspace();
        let rv = ks.put("/a", b"x").unwrap();
        ks.delete("/a").unwrap();
        assert!(ks.compare_and_swap("/a", Some(rv), b"y").unwrap_err().is_not_found());
    }

    #[test]
    fn delete_at_is_conditional() {
        let ks = test_keyspace();
        let rv = ks.put("/a", b"x").unwrap();
        ks.put("/a", b"y").unwrap();
        assert!(ks.delete_at("/a", rv).unwrap_err().is_conflict());
        assert!(ks.get("/a").unwrap().is_some());
    }

    // ── Listing ────────────────────────────────────────────────────

    #[test]
    fn list_filters_by_prefix_and_reports_revision() {
        let ks = test_keyspace();
        ks.put("/apps/ns/a", b"1").unwrap();
        ks.put("/apps/ns/b", b"1").unwrap();
        ks.put("/other/ns/c", b"1").unwrap();

        let snap = ks.list("/apps/").unwrap();
        assert_eq!(snap.revision, 3);
        assert_eq!(snap.items.len(), 2);
        assert!(snap.items.iter().all(|kv| kv.key.starts_with("/apps/")));
    }

    // ── Compaction ─────────────────────────────────────────────────

    #[test]
    fn compaction_makes_old_revisions_stale() {
        let ks = test_keyspace();
        for i in 0..10u8 {
            ks.put("/a", &[i]).unwrap();
        }
        assert_eq!(ks.compact(6).unwrap(), 5);
        assert_eq!(ks.compaction_boundary().unwrap(), 6);

        match ks.watch("/", 3) {
            Err(StateError::StaleRevision { requested, compacted }) => {
                assert_eq!(requested, 3);
                assert_eq!(compacted, 6);
            }
            other => panic!("expected stale revision, got {:?}", other.map(|_| ())),
        }
        assert!(ks.watch("/", 6).is_ok());
    }

    #[test]
    fn compaction_never_moves_backwards() {
        let ks = test_keyspace();
        for i in 0..5u8 {
            ks.put("/a", &[i]).unwrap();
        }
        ks.compact(4).unwrap();
        assert_eq!(ks.compact(2).unwrap(), 0);
        assert_eq!(ks.compaction_boundary().unwrap(), 4);
        // Clamped to current + 1.
        ks.compact(100).unwrap();
        assert_eq!(ks.compaction_boundary().unwrap(), 6);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("keyspace.redb");

        {
            let ks = Keyspace::open(&db_path).unwrap();
            ks.put("/a", b"1").unwrap();
            ks.put("/a", b"2").unwrap();
        }

        let ks = Keyspace::open(&db_path).unwrap();
        assert_eq!(ks.current_revision().unwrap(), 2);
        assert_eq!(ks.get("/a").unwrap().unwrap().value, b"2");
    }
}

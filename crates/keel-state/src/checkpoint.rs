//! CheckpointStore — last processed revision per watched prefix.
//!
//! Kept in its own redb database, separate from the keyspace: the keyspace
//! is shared with other writers, the checkpoints belong to this controller.
//! A checkpoint only ever moves forward. An entry that cannot be decoded is
//! reported as [`StateError::CorruptCheckpoint`] instead of being reset,
//! since there is no safe revision to guess.

use std::path::Path;
use std::sync::Arc;

use keel_core::{Checkpoint, Revision};
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::CHECKPOINTS;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

#[derive(Clone)]
pub struct CheckpointStore {
    db: Arc<Database>,
}

fn decode(prefix: &str, bytes: &[u8]) -> StateResult<Checkpoint> {
    let checkpoint: Checkpoint =
        serde_json::from_slice(bytes).map_err(|e| StateError::CorruptCheckpoint {
            prefix: prefix.to_string(),
            reason: e.to_string(),
        })?;
    if checkpoint.watched_prefix != prefix {
        return Err(StateError::CorruptCheckpoint {
            prefix: prefix.to_string(),
            reason: format!("entry names prefix {}", checkpoint.watched_prefix),
        });
    }
    Ok(checkpoint)
}

impl CheckpointStore {
    /// Open (or create) a persistent checkpoint store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "checkpoint store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory checkpoint store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Load the checkpoint for a prefix.
    pub fn load(&self, prefix: &str) -> StateResult<Option<Checkpoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        match table.get(prefix).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(prefix, guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all checkpoints, failing on the first corrupt entry.
    pub fn list(&self) -> StateResult<Vec<Checkpoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(key.value(), value.value())?);
        }
        Ok(results)
    }

    /// Move the checkpoint for `prefix` to `revision`.
    ///
    /// Returns `false` without writing if the stored checkpoint is already
    /// at or past `revision`.
    pub fn advance(&self, prefix: &str, revision: Revision) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let advanced = {
            let mut table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
            let current = match table.get(prefix).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(prefix, guard.value())?),
                None => None,
            };

            match current {
                Some(cp) if cp.last_processed_revision >= revision => {
                    if cp.last_processed_revision > revision {
                        warn!(
                            %prefix,
                            stored = cp.last_processed_revision,
                            requested = revision,
                            "ignoring checkpoint regression"
                        );
                    }
                    false
                }
                _ => {
                    let checkpoint = Checkpoint {
                        watched_prefix: prefix.to_string(),
                        last_processed_revision: revision,
                    };
                    let value = serde_json::to_vec(&checkpoint).map_err(map_err!(Serialize))?;
                    table
                        .insert(prefix, value.as_slice())
                        .map_err(map_err!(Write))?;
                    true
                }
            }
        };
        if advanced {
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(%prefix, revision, "checkpoint advanced");
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(advanced)
    }

    /// Overwrite a raw entry. Used to exercise corruption handling.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, prefix: &str, bytes: &[u8]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
            table.insert(prefix, bytes).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "/registry/demo.mycompany.com/configmapapps/";

    #[test]
    fn missing_checkpoint_is_none() {
        let store = CheckpointStore::open_in_memory().unwrap();
        assert!(store.load(PREFIX).unwrap().is_none());
    }

    #[test]
    fn advance_is_monotonic() {
        let store = CheckpointStore::open_in_memory().unwrap();
        assert!(store.advance(PREFIX, 10).unwrap());
        assert!(store.advance(PREFIX, 12).unwrap());
        assert!(!store.advance(PREFIX, 11).unwrap());
        assert!(!store.advance(PREFIX, 12).unwrap());

        let cp = store.load(PREFIX).unwrap().unwrap();
        assert_eq!(cp.last_processed_revision, 12);
    }

    #[test]
    fn prefixes_are_independent() {
        let store = CheckpointStore::open_in_memory().unwrap();
        store.advance(PREFIX, 5).unwrap();
        store.advance("/registry/demo.mycompany.com/simpleapps/", 9).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.load(PREFIX).unwrap().unwrap().last_processed_revision, 5);
    }

    #[test]
    fn corrupt_entry_fails_loudly() {
        let store = CheckpointStore::open_in_memory().unwrap();
        store.put_raw(PREFIX, b"{not json").unwrap();

        assert!(matches!(
            store.load(PREFIX),
            Err(StateError::CorruptCheckpoint { .. })
        ));
        assert!(store.list().is_err());
        assert!(store.advance(PREFIX, 3).is_err());
    }

    #[test]
    fn checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.redb");
        {
            let store = CheckpointStore::open(&path).unwrap();
            store.advance(PREFIX, 900).unwrap();
        }
        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.load(PREFIX).unwrap().unwrap().last_processed_revision, 900);
    }
}

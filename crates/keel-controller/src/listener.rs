//! Watch listener — turns a checkpoint into an ordered event source.
//!
//! A listener resumes from the revision after a checkpoint. When that
//! revision has been compacted away it falls back to a snapshot: one
//! synthetic PUT per live key, stamped with the snapshot revision, followed
//! by a watch from the snapshot revision + 1.

use std::collections::VecDeque;

use keel_core::{ChangeEvent, Checkpoint, EventType, Revision};
use keel_state::{Keyspace, WatchStream};
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, ReconcileResult};

/// Where a listener starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Every event with `mod_revision >= revision`.
    Revision(Revision),
    /// A fresh list of the prefix, then the events after it.
    Snapshot,
}

pub struct WatchListener {
    keyspace: Keyspace,
    prefix: String,
}

impl WatchListener {
    pub fn new(keyspace: Keyspace, prefix: impl Into<String>) -> Self {
        Self {
            keyspace,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Open an event source. Fails with [`ReconcileError::StaleRevision`]
    /// if `Revision(r)` precedes the compaction boundary.
    pub fn open(&self, from: StartFrom) -> ReconcileResult<EventSource> {
        match from {
            StartFrom::Revision(revision) => {
                let stream = self.keyspace.watch(&self.prefix, revision)?;
                debug!(prefix = %self.prefix, revision, "listener resumed from revision");
                Ok(EventSource {
                    synthetic: VecDeque::new(),
                    stream,
                    after: revision.saturating_sub(1),
                    snapshot_revision: None,
                })
            }
            StartFrom::Snapshot => {
                let snapshot = self.keyspace.list(&self.prefix)?;
                let stream = self.keyspace.watch(&self.prefix, snapshot.revision + 1)?;
                let synthetic: VecDeque<ChangeEvent> = snapshot
                    .items
                    .into_iter()
                    .map(|kv| ChangeEvent {
                        event_type: EventType::Put,
                        key: kv.key,
                        value: Some(kv.value),
                        prev_value: None,
                        create_revision: kv.create_revision,
                        mod_revision: snapshot.revision,
                        version: kv.version,
                    })
                    .collect();
                info!(
                    prefix = %self.prefix,
                    revision = snapshot.revision,
                    keys = synthetic.len(),
                    "listener started from snapshot"
                );
                Ok(EventSource {
                    synthetic,
                    stream,
                    after: snapshot.revision,
                    snapshot_revision: Some(snapshot.revision),
                })
            }
        }
    }

    /// Open from a checkpoint, falling back to a snapshot when there is
    /// none or when its history has been compacted.
    pub fn resume(&self, checkpoint: Option<&Checkpoint>) -> ReconcileResult<EventSource> {
        let Some(checkpoint) = checkpoint else {
            return self.open(StartFrom::Snapshot);
        };
        match self.open(StartFrom::Revision(checkpoint.last_processed_revision + 1)) {
            Err(ReconcileError::StaleRevision {
                requested,
                compacted,
            }) => {
                warn!(
                    prefix = %self.prefix,
                    requested,
                    compacted,
                    "checkpoint predates compaction, re-listing"
                );
                self.open(StartFrom::Snapshot)
            }
            other => other,
        }
    }
}

/// Ordered events for one prefix. Events at or before the resume point
/// are dropped, so every event is handed out at most once per source.
pub struct EventSource {
    synthetic: VecDeque<ChangeEvent>,
    stream: WatchStream,
    after: Revision,
    snapshot_revision: Option<Revision>,
}

impl EventSource {
    /// Revision of the snapshot this source started from, if any.
    pub fn snapshot_revision(&self) -> Option<Revision> {
        self.snapshot_revision
    }

    /// Whether synthetic snapshot events are still queued. The snapshot
    /// revision cannot be checkpointed until they are all handed out.
    pub fn in_snapshot(&self) -> bool {
        !self.synthetic.is_empty()
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> ReconcileResult<ChangeEvent> {
        if let Some(event) = self.synthetic.pop_front() {
            return Ok(event);
        }
        loop {
            let event = self.stream.next().await?;
            if let Some(event) = self.admit(event) {
                return Ok(event);
            }
        }
    }

    /// Next event if one is ready, without waiting.
    pub fn try_next(&mut self) -> ReconcileResult<Option<ChangeEvent>> {
        if let Some(event) = self.synthetic.pop_front() {
            return Ok(Some(event));
        }
        while let Some(event) = self.stream.try_next()? {
            if let Some(event) = self.admit(event) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn admit(&mut self, event: ChangeEvent) -> Option<ChangeEvent> {
        if event.mod_revision <= self.after {
            debug!(key = %event.key, revision = event.mod_revision, "dropping replayed event");
            return None;
        }
        self.after = event.mod_revision;
        Some(event)
    }
}

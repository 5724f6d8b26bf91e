//! Watch streams over the keyspace event log.
//!
//! A stream first drains the history backlog read when it was opened, then
//! follows live commits. Live events at or below the stream's floor were
//! already covered by the backlog and are dropped. A stream that falls too
//! far behind, or is disconnected, ends with [`StateError::WatchClosed`];
//! the caller reopens it from its own resume point.

use std::collections::VecDeque;

use keel_core::{ChangeEvent, Revision};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};

use crate::error::{StateError, StateResult};

pub struct WatchStream {
    prefix: String,
    backlog: VecDeque<ChangeEvent>,
    live: broadcast::Receiver<ChangeEvent>,
    generation: watch::Receiver<u64>,
    floor: Revision,
    last_delivered: Option<Revision>,
    closed: Option<String>,
}

impl WatchStream {
    pub(crate) fn new(
        prefix: String,
        backlog: VecDeque<ChangeEvent>,
        live: broadcast::Receiver<ChangeEvent>,
        generation: watch::Receiver<u64>,
        floor: Revision,
    ) -> Self {
        Self {
            prefix,
            backlog,
            live,
            generation,
            floor,
            last_delivered: None,
            closed: None,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Revision of the last event handed out, if any.
    pub fn last_delivered(&self) -> Option<Revision> {
        self.last_delivered
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> StateResult<ChangeEvent> {
        self.check_open()?;
        if let Some(event) = self.backlog.pop_front() {
            return Ok(self.deliver(event));
        }

        loop {
            tokio::select! {
                received = self.live.recv() => match received {
                    Ok(event) => {
                        if self.accepts(&event) {
                            return Ok(self.deliver(event));
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        return Err(self.close(format!("lagged behind by {missed} events")));
                    }
                    Err(RecvError::Closed) => {
                        return Err(self.close("keyspace closed".to_string()));
                    }
                },
                _ = self.generation.changed() => {
                    return Err(self.close("disconnected by server".to_string()));
                }
            }
        }
    }

    /// Return the next event if one is ready, without waiting.
    pub fn try_next(&mut self) -> StateResult<Option<ChangeEvent>> {
        self.check_open()?;
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(self.deliver(event)));
        }

        loop {
            match self.live.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Ok(Some(self.deliver(event)));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(missed)) => {
                    return Err(self.close(format!("lagged behind by {missed} events")));
                }
                Err(TryRecvError::Closed) => {
                    return Err(self.close("keyspace closed".to_string()));
                }
            }
        }
    }

    fn check_open(&mut self) -> StateResult<()> {
        if let Some(reason) = &self.closed {
            return Err(StateError::WatchClosed(reason.clone()));
        }
        if self.generation.has_changed().unwrap_or(true) {
            return Err(self.close("disconnected by server".to_string()));
        }
        Ok(())
    }

    fn accepts(&self, event: &ChangeEvent) -> bool {
        event.mod_revision > self.floor && event.key.starts_with(&self.prefix)
    }

    fn deliver(&mut self, event: ChangeEvent) -> ChangeEvent {
        self.floor = self.floor.max(event.mod_revision);
        self.last_delivered = Some(event.mod_revision);
        event
    }

    fn close(&mut self, reason: String) -> StateError {
        self.closed = Some(reason.clone());
        StateError::WatchClosed(reason)
    }
}

//! Conflict resolver — read, mutate, compare-and-swap, retry.
//!
//! A conflicting write re-reads the key and retries at once, without
//! backoff, up to `max_attempts`. A key that disappears mid-update is
//! recreated (create-only CAS); that retry does not count as an attempt.

use keel_core::{ObservedChild, Revision};
use keel_state::{Keyspace, StateError};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ReconcileError, ReconcileResult};

/// Result of a guarded write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Written {
        resource_version: Revision,
        content: Value,
        created: bool,
    },
    /// `mutate` found nothing to change.
    Unchanged,
}

/// Current content of a key as seen by one attempt. `content` is `None`
/// when the key is absent or not a JSON document.
#[derive(Debug, Clone)]
struct Current {
    content: Option<Value>,
    resource_version: Option<Revision>,
}

#[derive(Clone)]
pub struct ConflictResolver {
    keyspace: Keyspace,
}

impl ConflictResolver {
    pub fn new(keyspace: Keyspace) -> Self {
        Self { keyspace }
    }

    fn read(&self, key: &str) -> ReconcileResult<Current> {
        Ok(match self.keyspace.get(key)? {
            Some(kv) => Current {
                content: serde_json::from_slice(&kv.value).ok(),
                resource_version: Some(kv.mod_revision),
            },
            None => Current {
                content: None,
                resource_version: None,
            },
        })
    }

    /// Apply `mutate` to the current content of `key` and write the result
    /// conditioned on the resourceVersion it was computed from.
    ///
    /// `observed` seeds the first attempt instead of a fresh read.
    /// `mutate` returns `None` when the content is already as desired.
    pub fn write_with_retry<F>(
        &self,
        key: &str,
        observed: Option<&ObservedChild>,
        max_attempts: u32,
        mut mutate: F,
    ) -> ReconcileResult<WriteOutcome>
    where
        F: FnMut(Option<&Value>) -> Option<Value>,
    {
        let max_attempts = max_attempts.max(1);
        let mut current = match observed {
            Some(observed) => Current {
                content: Some(observed.content.clone()),
                resource_version: Some(observed.resource_version),
            },
            None => self.read(key)?,
        };
        let mut attempts = 0;

        loop {
            let Some(next) = mutate(current.content.as_ref()) else {
                return Ok(WriteOutcome::Unchanged);
            };
            let bytes = serde_json::to_vec(&next)?;
            attempts += 1;

            match self
                .keyspace
                .compare_and_swap(key, current.resource_version, &bytes)
            {
                Ok(resource_version) => {
                    return Ok(WriteOutcome::Written {
                        resource_version,
                        content: next,
                        created: current.resource_version.is_none(),
                    });
                }
                Err(StateError::Conflict { expected, actual, .. }) => {
                    if attempts >= max_attempts {
                        return Err(ReconcileError::ConflictExhausted {
                            key: key.to_string(),
                            attempts,
                        });
                    }
                    debug!(%key, ?expected, ?actual, attempts, "write conflict, re-reading");
                    current = self.read(key)?;
                }
                Err(StateError::NotFound(_)) => {
                    info!(%key, "update target disappeared, recreating");
                    attempts -= 1;
                    current = Current {
                        content: None,
                        resource_version: None,
                    };
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set_field(field: &'static str, value: i64) -> impl FnMut(Option<&Value>) -> Option<Value> {
        move |current: Option<&Value>| {
            let mut doc = current.cloned().unwrap_or_else(|| json!({}));
            if doc.get(field) == Some(&json!(value)) {
                return None;
            }
            doc[field] = json!(value);
            Some(doc)
        }
    }

    #[test]
    fn creates_absent_key() {
        let ks = Keyspace::open_in_memory().unwrap();
        let resolver = ConflictResolver::new(ks.clone());
        let outcome = resolver.write_with_retry("/k", None, 3, set_field("n", 1)).unwrap();
        assert!(matches!(outcome, WriteOutcome::Written { created: true, resource_version: 1, .. }));
    }

    #[test]
    fn unchanged_content_is_not_written() {
        let ks = Keyspace::open_in_memory().unwrap();
        ks.put("/k", br#"{"n":1}"#).unwrap();
        let resolver = ConflictResolver::new(ks.clone());
        let outcome = resolver.write_with_retry("/k", None, 3, set_field("n", 1)).unwrap();
        assert_eq!(outcome, WriteOutcome::Unchanged);
        assert_eq!(ks.current_revision().unwrap(), 1);
    }

    #[test]
    fn stale_observation_is_retried_and_preserves_foreign_fields() {
        let ks = Keyspace::open_in_memory().unwrap();
        let rv = ks.put("/k", br#"{"n":1}"#).unwrap();
        // Concurrent writer adds a field after our observation.
        ks.put("/k", br#"{"n":1,"other":true}"#).unwrap();

        let observed = ObservedChild {
            content: json!({"n": 1}),
            resource_version: rv,
        };
        let resolver = ConflictResolver::new(ks.clone());
        let outcome = resolver
            .write_with_retry("/k", Some(&observed), 3, set_field("n", 2))
            .unwrap();
        let WriteOutcome::Written { resource_version, content, created } = outcome else {
            panic!("expected write");
        };
        assert_eq!(resource_version, 3);
        assert!(!created);
        assert_eq!(content, json!({"n": 2, "other": true}));
    }

    #[test]
    fn exhaustion_after_max_attempts() {
        let ks = Keyspace::open_in_memory().unwrap();
        ks.put("/k", br#"{"n":0}"#).unwrap();
        let resolver = ConflictResolver::new(ks.clone());

        let writer = ks.clone();
        let mut calls = 0;
        let err = resolver
            .write_with_retry("/k", None, 3, |current| {
                calls += 1;
                // Another writer gets in between every read and write.
                writer.put("/k", format!(r#"{{"n":{calls}0}}"#).as_bytes()).unwrap();
                let mut doc = current.cloned().unwrap_or_else(|| json!({}));
                doc["mine"] = json!(true);
                Some(doc)
            })
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ConflictExhausted { attempts: 3, .. }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn vanished_target_is_recreated() {
        let ks = Keyspace::open_in_memory().unwrap();
        let rv = ks.put("/k", br#"{"n":1}"#).unwrap();
        ks.delete("/k").unwrap();

        let observed = ObservedChild {
            content: json!({"n": 1}),
            resource_version: rv,
        };
        let resolver = ConflictResolver::new(ks.clone());
        let outcome = resolver
            .write_with_retry("/k", Some(&observed), 1, set_field("n", 2))
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Written { created: true, .. }));
        assert_eq!(ks.get("/k").unwrap().unwrap().version, 1);
    }
}

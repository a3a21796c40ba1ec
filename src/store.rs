//! The location store: validated, retrying access to a backing store.

use crate::error::{GeoFireError, Result};
use crate::geohash::HashRange;
use crate::spatial::Location;
use crate::storage::{ChangeCallback, Entry, LocationBackend, SubscriptionId};
use crate::types::{Config, RetryPolicy};
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Longest identifier accepted, in bytes.
pub const MAX_ID_BYTES: usize = 768;

const FORBIDDEN_ID_CHARS: &[char] = &['.', '#', '$', '[', ']', '/'];

/// Check an identifier against the realtime database key rules.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(GeoFireError::invalid("identifier must not be empty"));
    }
    if id.len() > MAX_ID_BYTES {
        return Err(GeoFireError::invalid(format!(
            "identifier is {} bytes, maximum is {}",
            id.len(),
            MAX_ID_BYTES
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| FORBIDDEN_ID_CHARS.contains(c) || c.is_ascii_control())
    {
        return Err(GeoFireError::invalid(format!(
            "identifier '{}' contains forbidden character {:?}",
            id, bad
        )));
    }
    Ok(())
}

/// Run `op`, retrying transient failures with backoff until the policy or the
/// deadline is exhausted.
pub(crate) fn with_retry<T>(
    policy: &RetryPolicy,
    timeout: Duration,
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let started = Instant::now();
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                if started.elapsed() + delay > timeout {
                    return Err(GeoFireError::Unavailable(format!(
                        "{} timed out after {} attempts: {}",
                        what, attempt, err
                    )));
                }
                warn!(
                    "[LocationStore] {} failed (attempt {}/{}), retrying in {:?}: {}",
                    what, attempt, policy.max_attempts, delay, err
                );
                thread::sleep(delay);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Authoritative identifier → location mapping on top of a [`LocationBackend`].
#[derive(Clone)]
pub struct LocationStore {
    backend: Arc<dyn LocationBackend>,
    config: Arc<Config>,
}

impl LocationStore {
    pub fn new(backend: Arc<dyn LocationBackend>, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn LocationBackend> {
        &self.backend
    }

    /// Upsert the location (and payload) for `id`.
    ///
    /// A `null` payload is stored as no payload.
    pub fn set_location(&self, id: &str, location: Location, data: Option<Value>) -> Result<()> {
        validate_id(id)?;
        let data = data.filter(|v| !v.is_null());
        let entry = Entry::new(id, location, self.config.precision)?.with_data(data);
        debug!("[LocationStore] set {} at {} ({})", id, location, entry.hash);
        self.backend.put(entry)
    }

    /// Delete `id`; `NotFound` when it is not stored.
    pub fn remove_location(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        match self.backend.delete(id)? {
            Some(_) => {
                debug!("[LocationStore] removed {}", id);
                Ok(())
            }
            None => Err(GeoFireError::NotFound(format!(
                "no location stored for '{}'",
                id
            ))),
        }
    }

    /// The stored location, or `None` when the identifier is unknown.
    pub fn get_location(&self, id: &str) -> Result<Option<Location>> {
        Ok(self.get_entry(id)?.map(|entry| entry.location))
    }

    pub fn get_entry(&self, id: &str) -> Result<Option<Entry>> {
        validate_id(id)?;
        self.backend.get(id)
    }

    pub fn scan_range(&self, range: &HashRange) -> Result<Vec<Entry>> {
        with_retry(
            &self.config.retry,
            self.config.store_timeout(),
            "scan",
            || self.backend.scan_prefix_range(range),
        )
    }

    pub fn subscribe_range_changes(
        &self,
        range: &HashRange,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionId> {
        with_retry(
            &self.config.retry,
            self.config.store_timeout(),
            "watch",
            || {
                self.backend
                    .watch_prefix_range(range.clone(), Arc::clone(&on_change))
            },
        )
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> Result<bool> {
        self.backend.unwatch(subscription)
    }

    pub fn len(&self) -> Result<usize> {
        self.backend.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.backend.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use serde_json::json;
    use std::cell::Cell;

    fn store() -> LocationStore {
        LocationStore::new(Arc::new(MemoryBackend::new()), Config::default()).unwrap()
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("driver:42").is_ok());
        assert!(validate_id("üñíçødé").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("a.b").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a[0]").is_err());
        assert!(validate_id("tab\there").is_err());
        assert!(validate_id(&"x".repeat(MAX_ID_BYTES + 1)).is_err());
    }

    #[test]
    fn test_set_get_remove() {
        let store = store();
        let location = Location::new(37.7853, -122.4056).unwrap();
        store
            .set_location("a", location, Some(json!({"name": "cab"})))
            .unwrap();

        assert_eq!(store.get_location("a").unwrap(), Some(location));
        let entry = store.get_entry("a").unwrap().unwrap();
        assert_eq!(entry.hash.precision(), 10);
        assert_eq!(entry.data, Some(json!({"name": "cab"})));

        store.remove_location("a").unwrap();
        assert_eq!(store.get_location("a").unwrap(), None);
        assert!(matches!(
            store.remove_location("a"),
            Err(GeoFireError::NotFound(_))
        ));
    }

    #[test]
    fn test_null_payload_is_dropped() {
        let store = store();
        let location = Location::new(1.0, 1.0).unwrap();
        store.set_location("a", location, Some(Value::Null)).unwrap();
        assert_eq!(store.get_entry("a").unwrap().unwrap().data, None);
    }

    #[test]
    fn test_rejects_malformed_identifier() {
        let store = store();
        let location = Location::new(1.0, 1.0).unwrap();
        assert!(matches!(
            store.set_location("bad.key", location, None),
            Err(GeoFireError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_retry_recovers_from_transient_failure() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            multiplier: 1.0,
        };
        let calls = Cell::new(0);
        let result = with_retry(&policy, Duration::from_secs(1), "scan", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(GeoFireError::Unavailable("flaky".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_gives_up_and_skips_permanent_errors() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            multiplier: 1.0,
        };
        let calls = Cell::new(0);
        let result: Result<()> = with_retry(&policy, Duration::from_secs(1), "scan", || {
            calls.set(calls.get() + 1);
            Err(GeoFireError::Unavailable("down".into()))
        });
        assert!(matches!(result, Err(GeoFireError::Unavailable(_))));
        assert_eq!(calls.get(), 2);

        calls.set(0);
        let result: Result<()> = with_retry(&policy, Duration::from_secs(1), "scan", || {
            calls.set(calls.get() + 1);
            Err(GeoFireError::invalid("nope"))
        });
        assert!(matches!(result, Err(GeoFireError::InvalidArgument(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_retry_respects_deadline() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 50,
            max_backoff_ms: 50,
            multiplier: 1.0,
        };
        let result: Result<()> = with_retry(&policy, Duration::from_millis(10), "watch", || {
            Err(GeoFireError::Unavailable("down".into()))
        });
        match result {
            Err(GeoFireError::Unavailable(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}

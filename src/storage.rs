//! Storage backend abstraction for GeoFire
//!
//! This module provides the trait every backing store adapter implements,
//! plus an in-memory backend. A backend keeps entries ordered by geohash so
//! that proximity queries can be answered by range scans, and it notifies
//! range watchers whenever an entry's hash enters, leaves or changes within a
//! watched range.

use crate::error::{GeoFireError, Result};
use crate::geohash::{GeoHash, HashRange};
use crate::spatial::Location;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One stored location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub location: Location,
    pub hash: GeoHash,
    /// Payload attached to the identifier, if any
    pub data: Option<Value>,
}

impl Entry {
    pub fn new(id: impl Into<String>, location: Location, precision: usize) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            hash: GeoHash::encode(&location, precision)?,
            location,
            data: None,
        })
    }

    pub fn with_data(mut self, data: Option<Value>) -> Self {
        self.data = data;
        self
    }
}

/// Handle returned by [`LocationBackend::watch_prefix_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Change notification: the identifier and its new entry, or `None` when removed.
pub type ChangeCallback = Arc<dyn Fn(&str, Option<&Entry>) + Send + Sync>;

/// Trait for backing store implementations
///
/// Implementations must report a write as successful only once it is visible
/// to readers, and must deliver notifications for one identifier in the order
/// its mutations were applied. Callbacks run outside the backend's data lock,
/// so they may read from the backend.
pub trait LocationBackend: Send + Sync {
    /// Insert or overwrite an entry
    fn put(&self, entry: Entry) -> Result<()>;

    /// Delete an entry, returning it if it existed
    fn delete(&self, id: &str) -> Result<Option<Entry>>;

    /// Get an entry by identifier
    fn get(&self, id: &str) -> Result<Option<Entry>>;

    /// All entries whose hash falls in the half-open range, in hash order
    fn scan_prefix_range(&self, range: &HashRange) -> Result<Vec<Entry>>;

    /// Register `on_change` for mutations touching `range`
    fn watch_prefix_range(&self, range: HashRange, on_change: ChangeCallback)
    -> Result<SubscriptionId>;

    /// Remove a watch; returns whether it was registered
    fn unwatch(&self, subscription: SubscriptionId) -> Result<bool>;

    /// Number of stored entries
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush any pending writes to persistent storage
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Storage backend statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub entry_count: usize,
    pub watch_count: usize,
    /// Number of mutations applied
    pub operations_count: u64,
    /// Number of callback invocations delivered
    pub notifications_count: u64,
}

#[derive(Default)]
struct MemoryData {
    entries: FxHashMap<String, Entry>,
    /// (hash, id) pairs; ordered by hash for range scans
    by_hash: BTreeSet<(String, String)>,
    operations_count: u64,
}

impl MemoryData {
    fn insert(&mut self, entry: Entry) -> Option<Entry> {
        let previous = self.entries.insert(entry.id.clone(), entry.clone());
        if let Some(ref old) = previous {
            self.by_hash
                .remove(&(old.hash.as_str().to_string(), old.id.clone()));
        }
        self.by_hash
            .insert((entry.hash.as_str().to_string(), entry.id));
        self.operations_count += 1;
        previous
    }

    fn remove(&mut self, id: &str) -> Option<Entry> {
        let previous = self.entries.remove(id)?;
        self.by_hash
            .remove(&(previous.hash.as_str().to_string(), previous.id.clone()));
        self.operations_count += 1;
        Some(previous)
    }
}

struct Watch {
    range: HashRange,
    on_change: ChangeCallback,
}

/// In-memory storage backend using an ordered hash index
pub struct MemoryBackend {
    data: RwLock<MemoryData>,
    watches: RwLock<BTreeMap<SubscriptionId, Watch>>,
    next_subscription: AtomicU64,
    notifications: AtomicU64,
    /// Serialises mutation + notification so callbacks observe store order
    write_order: Mutex<()>,
}

impl MemoryBackend {
    /// Create a new in-memory storage backend
    pub fn new() -> Self {
        Self {
            data: RwLock::new(MemoryData::default()),
            watches: RwLock::new(BTreeMap::new()),
            next_subscription: AtomicU64::new(1),
            notifications: AtomicU64::new(0),
            write_order: Mutex::new(()),
        }
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let data = self.read_data()?;
        let watches = self.read_watches()?;
        Ok(StorageStats {
            entry_count: data.entries.len(),
            watch_count: watches.len(),
            operations_count: data.operations_count,
            notifications_count: self.notifications.load(Ordering::Relaxed),
        })
    }

    /// Every stored entry, in hash order.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        let data = self.read_data()?;
        Ok(data
            .by_hash
            .iter()
            .filter_map(|(_, id)| data.entries.get(id).cloned())
            .collect())
    }

    /// Apply an entry without notifying watchers; used when replaying a log.
    pub(crate) fn load(&self, entry: Entry) -> Result<()> {
        self.write_data()?.insert(entry);
        Ok(())
    }

    pub(crate) fn unload(&self, id: &str) -> Result<()> {
        self.write_data()?.remove(id);
        Ok(())
    }

    pub(crate) fn lock_write_order(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_order
            .lock()
            .map_err(|_| GeoFireError::Lock("Failed to acquire write order lock".to_string()))
    }

    /// `put` for callers already holding the write order lock.
    pub(crate) fn put_ordered(&self, entry: Entry) -> Result<()> {
        let previous = self.write_data()?.insert(entry.clone());
        self.notify(&entry.id, previous.as_ref().map(|e| &e.hash), Some(&entry))
    }

    /// `delete` for callers already holding the write order lock.
    pub(crate) fn delete_ordered(&self, id: &str) -> Result<Option<Entry>> {
        let previous = self.write_data()?.remove(id);
        if let Some(ref old) = previous {
            self.notify(id, Some(&old.hash), None)?;
        }
        Ok(previous)
    }

    /// Invoke each watch whose range holds the old or the new hash, once per
    /// distinct callback, after the data lock has been released.
    fn notify(&self, id: &str, old_hash: Option<&GeoHash>, entry: Option<&Entry>) -> Result<()> {
        let touches = |range: &HashRange| {
            old_hash.is_some_and(|h| range.contains(h.as_str()))
                || entry.is_some_and(|e| range.contains(e.hash.as_str()))
        };

        let mut targets: Vec<ChangeCallback> = Vec::new();
        {
            let watches = self.read_watches()?;
            for watch in watches.values() {
                if touches(&watch.range)
                    && !targets.iter().any(|t| Arc::ptr_eq(t, &watch.on_change))
                {
                    targets.push(Arc::clone(&watch.on_change));
                }
            }
        }

        for on_change in targets {
            self.notifications.fetch_add(1, Ordering::Relaxed);
            on_change(id, entry);
        }
        Ok(())
    }

    fn read_data(&self) -> Result<RwLockReadGuard<'_, MemoryData>> {
        self.data
            .read()
            .map_err(|_| GeoFireError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write_data(&self) -> Result<RwLockWriteGuard<'_, MemoryData>> {
        self.data
            .write()
            .map_err(|_| GeoFireError::Lock("Failed to acquire write lock".to_string()))
    }

    fn read_watches(&self) -> Result<RwLockReadGuard<'_, BTreeMap<SubscriptionId, Watch>>> {
        self.watches
            .read()
            .map_err(|_| GeoFireError::Lock("Failed to acquire watch read lock".to_string()))
    }

    fn write_watches(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<SubscriptionId, Watch>>> {
        self.watches
            .write()
            .map_err(|_| GeoFireError::Lock("Failed to acquire watch write lock".to_string()))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationBackend for MemoryBackend {
    fn put(&self, entry: Entry) -> Result<()> {
        let _order = self.lock_write_order()?;
        self.put_ordered(entry)
    }

    fn delete(&self, id: &str) -> Result<Option<Entry>> {
        let _order = self.lock_write_order()?;
        self.delete_ordered(id)
    }

    fn get(&self, id: &str) -> Result<Option<Entry>> {
        Ok(self.read_data()?.entries.get(id).cloned())
    }

    fn scan_prefix_range(&self, range: &HashRange) -> Result<Vec<Entry>> {
        if range.start >= range.end {
            return Ok(Vec::new());
        }
        let data = self.read_data()?;
        let lower = (range.start.clone(), String::new());
        let upper = (range.end.clone(), String::new());
        Ok(data
            .by_hash
            .range(lower..upper)
            .filter_map(|(_, id)| data.entries.get(id).cloned())
            .collect())
    }

    fn watch_prefix_range(
        &self,
        range: HashRange,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionId> {
        let subscription = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.write_watches()?
            .insert(subscription, Watch { range, on_change });
        Ok(subscription)
    }

    fn unwatch(&self, subscription: SubscriptionId) -> Result<bool> {
        Ok(self.write_watches()?.remove(&subscription).is_some())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.read_data()?.entries.len())
    }
}

//! Live proximity queries.
//!
//! A [`GeoQuery`] watches the hash ranges covering its circle, scans them,
//! and turns every store change reported inside those ranges into events on
//! an [`EventStream`]. Range (re)subscription and inside-set mutation happen
//! under the query's own lock, so a notification racing with `start`,
//! `update` or `stop` is applied either fully before or fully after it.

use crate::error::{GeoFireError, Result};
use crate::events::{EventStream, GeoEvent, QueryEvent};
use crate::geohash::{covering_ranges, HashRange};
use crate::spatial::Location;
use crate::storage::{ChangeCallback, Entry, SubscriptionId};
use crate::store::LocationStore;
use crate::tracker::{ChangeTracker, Transition};
use crate::types::QueryMode;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use uuid::Uuid;

/// Opaque query identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a query. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Created,
    Scanning,
    Ready,
    Updating,
    Stopped,
}

/// A watched range and the subscription serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observer {
    pub range: HashRange,
    pub subscription: SubscriptionId,
}

struct QueryCore {
    state: QueryState,
    tracker: ChangeTracker,
    observers: Vec<Observer>,
    on_change: ChangeCallback,
}

struct Shared {
    id: QueryId,
    mode: QueryMode,
    store: LocationStore,
    events: EventStream,
    core: Mutex<QueryCore>,
}

impl Shared {
    fn lock_core(&self) -> Result<MutexGuard<'_, QueryCore>> {
        self.core
            .lock()
            .map_err(|_| GeoFireError::Lock(format!("query {} state lock poisoned", self.id)))
    }

    fn handle_change(&self, id: &str, entry: Option<&Entry>) {
        let mut core = match self.lock_core() {
            Ok(core) => core,
            Err(err) => {
                log::error!("[GeoQuery] dropping change for '{}': {}", id, err);
                return;
            }
        };
        if !matches!(core.state, QueryState::Ready | QueryState::Updating) {
            return;
        }
        if let Some(transition) = core.tracker.apply(id, entry) {
            self.emit_transition(transition);
        }
    }

    /// Watch then scan `ranges`, recording an observer per range. On failure
    /// the observers added here are released again.
    fn subscribe_and_scan(&self, core: &mut QueryCore, ranges: &[HashRange]) -> Result<Vec<Entry>> {
        let first_new = core.observers.len();
        let result = self.try_subscribe_and_scan(core, ranges);
        if result.is_err() {
            for observer in core.observers.split_off(first_new) {
                if let Err(err) = self.store.unsubscribe(observer.subscription) {
                    warn!(
                        "[GeoQuery] failed to release {} while rolling back: {}",
                        observer.subscription, err
                    );
                }
            }
        }
        result
    }

    fn try_subscribe_and_scan(
        &self,
        core: &mut QueryCore,
        ranges: &[HashRange],
    ) -> Result<Vec<Entry>> {
        for range in ranges {
            let subscription = self
                .store
                .subscribe_range_changes(range, Arc::clone(&core.on_change))?;
            debug!("[GeoQuery] {} watching {} as {}", self.id, range, subscription);
            core.observers.push(Observer {
                range: range.clone(),
                subscription,
            });
        }
        let mut entries = Vec::new();
        for range in ranges {
            entries.extend(self.store.scan_range(range)?);
        }
        Ok(entries)
    }

    /// Unsubscribe the observers selected by `remove`, keeping going after a
    /// failure and reporting the first one.
    fn release(&self, core: &mut QueryCore, remove: impl Fn(&Observer) -> bool) -> Result<()> {
        let (released, kept): (Vec<Observer>, Vec<Observer>) =
            std::mem::take(&mut core.observers).into_iter().partition(remove);
        core.observers = kept;

        let mut first_error = None;
        for observer in released {
            debug!(
                "[GeoQuery] {} releasing {} ({})",
                self.id, observer.range, observer.subscription
            );
            if let Err(err) = self.store.unsubscribe(observer.subscription) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn emit_transition(&self, transition: Transition) {
        let event = match transition {
            Transition::Entered { id, location, data } => GeoEvent::Entered {
                data: self.snapshot(&id, data),
                id,
                location,
            },
            Transition::Moved { id, location, data } => GeoEvent::Moved {
                data: self.snapshot(&id, data),
                id,
                location,
            },
            Transition::Changed { id, location, data } => GeoEvent::Changed {
                data: self.snapshot(&id, data),
                id,
                location,
            },
            Transition::Exited {
                id,
                last_location,
                data,
            } => GeoEvent::Exited {
                data: self.snapshot(&id, data),
                id,
                last_location: Some(last_location),
            },
        };
        self.emit(event);
    }

    /// The payload to attach in data mode, read from the store at emission.
    /// Falls back to the payload seen in the notification when the key is
    /// gone or the read fails.
    fn snapshot(&self, id: &str, seen: Option<Value>) -> Option<Value> {
        if !self.mode.carries_data() {
            return None;
        }
        match self.store.get_entry(id) {
            Ok(Some(entry)) => entry.data,
            Ok(None) => seen,
            Err(err) => {
                warn!("[GeoQuery] {} data read for '{}' failed: {}", self.id, id, err);
                self.emit(GeoEvent::Error {
                    kind: err.kind(),
                    message: err.to_string(),
                });
                seen
            }
        }
    }

    fn emit(&self, event: GeoEvent) {
        debug!("[GeoQuery] {} {} {:?}", self.id, event.name(), event.id());
        self.events.emit(QueryEvent {
            query: self.id,
            mode: self.mode,
            event,
        });
    }
}

fn change_callback(shared: Weak<Shared>) -> ChangeCallback {
    Arc::new(move |id: &str, entry: Option<&Entry>| {
        if let Some(shared) = shared.upgrade() {
            shared.handle_change(id, entry);
        }
    })
}

pub(crate) fn check_radius(radius: f64) -> Result<()> {
    if radius.is_finite() && radius > 0.0 {
        Ok(())
    } else {
        Err(GeoFireError::invalid(format!(
            "radius must be a positive number of meters, got {}",
            radius
        )))
    }
}

/// A live query over a [`LocationStore`].
///
/// Dropping a query that is still running stops it.
pub struct GeoQuery {
    shared: Arc<Shared>,
}

impl GeoQuery {
    /// Subscribe to and scan the ranges covering the circle, emit `Entered`
    /// for every key inside, then `Ready` with the matched set.
    pub fn start(
        store: LocationStore,
        events: EventStream,
        center: Location,
        radius: f64,
        mode: QueryMode,
    ) -> Result<Self> {
        check_radius(radius)?;
        let ranges = covering_ranges(&center, radius, store.config().precision)?;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            id: QueryId::new(),
            mode,
            store,
            events,
            core: Mutex::new(QueryCore {
                state: QueryState::Created,
                tracker: ChangeTracker::new(
                    center,
                    radius,
                    ranges.iter().cloned(),
                    mode.carries_data(),
                ),
                observers: Vec::new(),
                on_change: change_callback(weak.clone()),
            }),
        });

        {
            let mut core = shared.lock_core()?;
            core.state = QueryState::Scanning;
            let entries = match shared.subscribe_and_scan(&mut core, &ranges) {
                Ok(entries) => entries,
                Err(err) => {
                    core.state = QueryState::Stopped;
                    return Err(err);
                }
            };
            for transition in core.tracker.load(entries) {
                shared.emit_transition(transition);
            }
            core.state = QueryState::Ready;
            info!(
                "[GeoQuery] {} started at {} radius {}m over {} ranges, {} inside",
                shared.id,
                center,
                radius,
                ranges.len(),
                core.tracker.inside_count()
            );
            shared.emit(GeoEvent::Ready {
                matched: core.tracker.matched_ids(),
            });
        }

        Ok(Self { shared })
    }

    /// Move or resize the circle without restarting.
    ///
    /// Ranges that stay covered keep their subscriptions; dropped ranges are
    /// released and new ones are watched and scanned. Keys crossing the new
    /// boundary produce `Entered`/`Exited`, followed by a fresh `Ready`.
    pub fn update(&self, center: Location, radius: f64) -> Result<()> {
        check_radius(radius)?;
        let shared = &self.shared;
        let ranges = covering_ranges(&center, radius, shared.store.config().precision)?;

        let mut core = shared.lock_core()?;
        if core.state == QueryState::Stopped {
            return Err(GeoFireError::AlreadyStopped);
        }
        core.state = QueryState::Updating;

        let added: Vec<HashRange> = ranges
            .iter()
            .filter(|range| !core.observers.iter().any(|o| &o.range == *range))
            .cloned()
            .collect();
        let entries = match shared.subscribe_and_scan(&mut core, &added) {
            Ok(entries) => entries,
            Err(err) => {
                core.state = QueryState::Ready;
                return Err(err);
            }
        };
        let released = shared.release(&mut core, |o| !ranges.contains(&o.range));

        for transition in core
            .tracker
            .recenter(center, radius, ranges.iter().cloned(), entries)
        {
            shared.emit_transition(transition);
        }
        core.state = QueryState::Ready;
        info!(
            "[GeoQuery] {} moved to {} radius {}m (+{} ranges), {} inside",
            shared.id,
            center,
            radius,
            added.len(),
            core.tracker.inside_count()
        );
        shared.emit(GeoEvent::Ready {
            matched: core.tracker.matched_ids(),
        });
        released
    }

    /// Release every subscription. No event from this query is emitted once
    /// `stop` returns.
    pub fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        let mut core = shared.lock_core()?;
        if core.state == QueryState::Stopped {
            return Err(GeoFireError::AlreadyStopped);
        }
        core.state = QueryState::Stopped;
        let released = shared.release(&mut core, |_| true);
        info!("[GeoQuery] {} stopped", shared.id);
        released
    }

    pub fn id(&self) -> QueryId {
        self.shared.id
    }

    pub fn mode(&self) -> QueryMode {
        self.shared.mode
    }

    pub fn state(&self) -> Result<QueryState> {
        Ok(self.shared.lock_core()?.state)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state(), Ok(QueryState::Stopped) | Err(_))
    }

    pub fn center(&self) -> Result<Location> {
        Ok(self.shared.lock_core()?.tracker.center())
    }

    pub fn radius(&self) -> Result<f64> {
        Ok(self.shared.lock_core()?.tracker.radius())
    }

    /// Identifiers currently inside the circle, sorted.
    pub fn matched_ids(&self) -> Result<Vec<String>> {
        Ok(self.shared.lock_core()?.tracker.matched_ids())
    }

    /// Ranges currently watched.
    pub fn covering_ranges(&self) -> Result<Vec<HashRange>> {
        Ok(self
            .shared
            .lock_core()?
            .observers
            .iter()
            .map(|o| o.range.clone())
            .collect())
    }

    pub fn observers(&self) -> Result<Vec<Observer>> {
        Ok(self.shared.lock_core()?.observers.clone())
    }
}

impl fmt::Debug for GeoQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoQuery")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("state", &self.state().ok())
            .finish()
    }
}

impl Drop for GeoQuery {
    fn drop(&mut self) {
        if self.is_stopped() {
            return;
        }
        if let Err(err) = self.stop() {
            warn!("[GeoQuery] {} failed to stop on drop: {}", self.shared.id, err);
        }
    }
}

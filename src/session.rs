//! Session management: at most one active query per observation mode, one
//! event subscriber, and the location operations a transport exposes.

use crate::error::{GeoFireError, Result};
use crate::events::{EventStream, QueryEvent};
use crate::geohash::GeoHash;
use crate::query::{check_radius, GeoQuery, Observer, QueryId};
use crate::spatial::Location;
use crate::store::LocationStore;
use crate::types::{ModePolicy, QueryMode};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::{Mutex, MutexGuard};

/// Caller-side reference to a query owned by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryHandle {
    pub id: QueryId,
    pub mode: QueryMode,
}

/// Owns the active queries and the event stream they share.
pub struct SessionManager {
    store: LocationStore,
    events: EventStream,
    mode_policy: ModePolicy,
    queries: Mutex<BTreeMap<QueryMode, GeoQuery>>,
}

impl SessionManager {
    pub fn new(store: LocationStore) -> Self {
        let mode_policy = store.config().mode_policy;
        Self {
            store,
            events: EventStream::new(),
            mode_policy,
            queries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &LocationStore {
        &self.store
    }

    /// Start a query, first tearing down the query it replaces: the one of
    /// the same mode, or every query under [`ModePolicy::Exclusive`].
    pub fn start_query(&self, center: Location, radius: f64, mode: QueryMode) -> Result<QueryHandle> {
        check_radius(radius)?;
        let mut queries = self.lock_queries()?;

        let replaced: Vec<QueryMode> = match self.mode_policy {
            ModePolicy::Independent => vec![mode],
            ModePolicy::Exclusive => queries.keys().copied().collect(),
        };
        for old_mode in replaced {
            if let Some(old) = queries.remove(&old_mode) {
                debug!("[Session] replacing {:?} query {}", old_mode, old.id());
                stop_quietly(&old)?;
            }
        }

        let query = GeoQuery::start(
            self.store.clone(),
            self.events.clone(),
            center,
            radius,
            mode,
        )?;
        let handle = QueryHandle {
            id: query.id(),
            mode,
        };
        queries.insert(mode, query);
        info!("[Session] {:?} query {} active", mode, handle.id);
        Ok(handle)
    }

    pub fn update_query(&self, handle: &QueryHandle, center: Location, radius: f64) -> Result<()> {
        let queries = self.lock_queries()?;
        match queries.get(&handle.mode) {
            Some(query) if query.id() == handle.id => query.update(center, radius),
            _ => Err(GeoFireError::AlreadyStopped),
        }
    }

    pub fn stop_query(&self, handle: &QueryHandle) -> Result<()> {
        let mut queries = self.lock_queries()?;
        match queries.get(&handle.mode) {
            Some(query) if query.id() == handle.id => {}
            _ => return Err(GeoFireError::AlreadyStopped),
        }
        match queries.remove(&handle.mode) {
            Some(query) => query.stop(),
            None => Err(GeoFireError::AlreadyStopped),
        }
    }

    /// Stop the query of one mode; returns whether one was running.
    pub fn remove_listener(&self, mode: QueryMode) -> Result<bool> {
        let query = self.lock_queries()?.remove(&mode);
        match query {
            Some(query) => {
                stop_quietly(&query)?;
                info!("[Session] {:?} listener removed", mode);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop every query; returns how many were running.
    pub fn stop_all(&self) -> Result<usize> {
        let stopped = std::mem::take(&mut *self.lock_queries()?);
        let mut first_error = None;
        for query in stopped.values() {
            if let Err(err) = stop_quietly(query) {
                first_error.get_or_insert(err);
            }
        }
        if !stopped.is_empty() {
            info!("[Session] stopped {} queries", stopped.len());
        }
        first_error.map_or(Ok(stopped.len()), Err)
    }

    pub fn active(&self, mode: QueryMode) -> Result<Option<QueryHandle>> {
        Ok(self.lock_queries()?.get(&mode).map(|query| QueryHandle {
            id: query.id(),
            mode,
        }))
    }

    pub fn active_handles(&self) -> Result<Vec<QueryHandle>> {
        Ok(self
            .lock_queries()?
            .iter()
            .map(|(mode, query)| QueryHandle {
                id: query.id(),
                mode: *mode,
            })
            .collect())
    }

    /// Every live range subscription, by owning query.
    pub fn observer_handles(&self) -> Result<Vec<(QueryHandle, Observer)>> {
        let queries = self.lock_queries()?;
        let mut handles = Vec::new();
        for (mode, query) in queries.iter() {
            let handle = QueryHandle {
                id: query.id(),
                mode: *mode,
            };
            handles.extend(query.observers()?.into_iter().map(|o| (handle, o)));
        }
        Ok(handles)
    }

    /// Subscribe to events, replacing any previous subscriber.
    pub fn listen(&self) -> Receiver<QueryEvent> {
        info!("[Session] event subscriber attached");
        self.events.listen()
    }

    /// Drop the subscriber and release every query.
    pub fn cancel(&self) -> Result<()> {
        self.events.cancel();
        let stopped = self.stop_all()?;
        info!("[Session] cancelled, {} queries released", stopped);
        Ok(())
    }

    pub fn set_location(&self, id: &str, location: Location, data: Option<Value>) -> Result<()> {
        self.store.set_location(id, location, data)
    }

    pub fn remove_location(&self, id: &str) -> Result<()> {
        self.store.remove_location(id)
    }

    pub fn get_location(&self, id: &str) -> Result<Option<Location>> {
        self.store.get_location(id)
    }

    pub fn compute_hash(&self, location: &Location, precision: usize) -> Result<GeoHash> {
        GeoHash::encode(location, precision)
    }

    fn lock_queries(&self) -> Result<MutexGuard<'_, BTreeMap<QueryMode, GeoQuery>>> {
        self.queries
            .lock()
            .map_err(|_| GeoFireError::Lock("session query table poisoned".to_string()))
    }
}

/// Stop a query that may already have stopped on its own.
fn stop_quietly(query: &GeoQuery) -> Result<()> {
    match query.stop() {
        Err(GeoFireError::AlreadyStopped) => Ok(()),
        other => other,
    }
}

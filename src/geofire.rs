//! The `GeoFire` entry point.

use crate::builder::GeoFireBuilder;
use crate::error::Result;
use crate::events::{EventStream, QueryEvent};
use crate::geohash::GeoHash;
use crate::query::GeoQuery;
use crate::session::SessionManager;
use crate::spatial::Location;
use crate::storage::LocationBackend;
use crate::store::LocationStore;
use crate::types::{Config, QueryMode};
use serde_json::Value;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// A location store plus the session that runs queries against it.
///
/// # Examples
///
/// ```rust
/// use geofire::{GeoEvent, GeoFire, Location, QueryMode};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let geofire = GeoFire::memory()?;
/// geofire.set_location("cab-1", Location::new(37.7853, -122.4056)?, None)?;
///
/// let events = geofire.session().listen();
/// geofire
///     .session()
///     .start_query(Location::new(37.7850, -122.4050)?, 500.0, QueryMode::Locations)?;
///
/// let mut entered = Vec::new();
/// while let Ok(event) = events.try_recv() {
///     if let GeoEvent::Entered { id, .. } = event.event {
///         entered.push(id);
///     }
/// }
/// assert_eq!(entered, vec!["cab-1"]);
/// # Ok(())
/// # }
/// ```
pub struct GeoFire {
    store: LocationStore,
    session: SessionManager,
}

impl GeoFire {
    /// An in-memory instance with default configuration.
    pub fn memory() -> Result<Self> {
        GeoFireBuilder::new().in_memory().build()
    }

    /// A durable instance backed by an append-only file at `path`.
    #[cfg(feature = "aof")]
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        GeoFireBuilder::new()
            .aof_path(path.as_ref().to_path_buf())
            .build()
    }

    pub fn builder() -> GeoFireBuilder {
        GeoFireBuilder::new()
    }

    pub fn with_backend(backend: Arc<dyn LocationBackend>, config: Config) -> Result<Self> {
        let store = LocationStore::new(backend, config)?;
        Ok(Self {
            session: SessionManager::new(store.clone()),
            store,
        })
    }

    pub fn config(&self) -> &Config {
        self.store.config()
    }

    pub fn store(&self) -> &LocationStore {
        &self.store
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
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

    /// A standalone query with its own event channel, outside the session's
    /// one-query-per-mode bookkeeping.
    pub fn query_at_location(
        &self,
        center: Location,
        radius: f64,
        mode: QueryMode,
    ) -> Result<(GeoQuery, Receiver<QueryEvent>)> {
        let events = EventStream::new();
        let receiver = events.listen();
        let query = GeoQuery::start(self.store.clone(), events, center, radius, mode)?;
        Ok((query, receiver))
    }

    /// Flush the backing store.
    pub fn sync(&self) -> Result<()> {
        self.store.backend().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GeoEvent;

    #[test]
    fn test_standalone_queries_are_independent() {
        let geofire = GeoFire::memory().unwrap();
        geofire
            .set_location("a", Location::new(0.0, 0.0).unwrap(), None)
            .unwrap();

        let (near, near_rx) = geofire
            .query_at_location(Location::new(0.0, 0.0).unwrap(), 100.0, QueryMode::Locations)
            .unwrap();
        let (_far, far_rx) = geofire
            .query_at_location(Location::new(20.0, 20.0).unwrap(), 100.0, QueryMode::Locations)
            .unwrap();

        assert_eq!(near.matched_ids().unwrap(), vec!["a"]);
        assert_eq!(near_rx.try_iter().count(), 2);
        assert_eq!(
            far_rx.try_iter().map(|e| e.event).collect::<Vec<_>>(),
            vec![GeoEvent::Ready { matched: vec![] }]
        );
    }

    #[test]
    fn test_compute_hash() {
        let geofire = GeoFire::memory().unwrap();
        let hash = geofire
            .compute_hash(&Location::new(10.0, 10.0).unwrap(), 10)
            .unwrap();
        assert_eq!(hash.as_str(), "s1z0gs3y0z");
        assert!(geofire
            .compute_hash(&Location::new(10.0, 10.0).unwrap(), 0)
            .is_err());
    }
}

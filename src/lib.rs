//! # GeoFire - realtime proximity queries over geohash-indexed locations
//!
//! GeoFire keeps a set of moving points keyed by identifier and answers
//! "who is within R meters of P" with live queries that report keys
//! entering, moving within and leaving the circle as the store changes.
//!
//! ## Features
//!
//! - **GeoHash codec**: encoding, decoding, neighbors and the covering hash
//!   ranges for a circle, antimeridian and poles included
//! - **Location store**: identifier → location (+ optional JSON payload),
//!   ordered by geohash for range scans, with range change subscriptions
//! - **Live queries**: `Entered`/`Moved`/`Changed`/`Exited` events and a
//!   `Ready` snapshot after every (re)scan, with incremental re-centering
//! - **Sessions**: one query per observation mode, a single event
//!   subscriber and a JSON command protocol for transports
//! - **Persistent storage**: append-only file backend with replay and
//!   compaction (`aof` feature, on by default)
//!
//! ## Quick Start
//!
//! ```rust
//! use geofire::{GeoEvent, GeoFire, Location, QueryMode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let geofire = GeoFire::memory()?;
//! geofire.set_location("a", Location::new(0.0, 0.0)?, None)?;
//!
//! let events = geofire.session().listen();
//! let handle = geofire
//!     .session()
//!     .start_query(Location::new(0.0, 0.001)?, 500.0, QueryMode::Locations)?;
//!
//! // The initial scan reports "a" and then the ready snapshot
//! let ready = events
//!     .try_iter()
//!     .find_map(|e| match e.event {
//!         GeoEvent::Ready { matched } => Some(matched),
//!         _ => None,
//!     })
//!     .unwrap_or_default();
//! assert_eq!(ready, vec!["a"]);
//!
//! // Moving "a" far away produces a single exit
//! geofire.set_location("a", Location::new(10.0, 10.0)?, None)?;
//! let next = events.try_recv()?;
//! assert!(matches!(next.event, GeoEvent::Exited { .. }));
//!
//! geofire.session().stop_query(&handle)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire protocol
//!
//! ```rust
//! use geofire::GeoFire;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let geofire = GeoFire::memory()?;
//! let reply = geofire.session().dispatch_json(
//!     r#"{"method": "computeHash", "location": {"latitude": 0.0, "longitude": 0.0}, "precision": 5}"#,
//! );
//! assert_eq!(reply, r#"{"status":"ok","result":{"hash":"s0000"}}"#);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod error;
pub mod events;
pub mod geofire;
pub mod geohash;
#[cfg(feature = "aof")]
pub mod persistence;
pub mod protocol;
pub mod query;
pub mod session;
pub mod spatial;
pub mod storage;
pub mod store;
pub mod tracker;
pub mod types;

pub use builder::GeoFireBuilder;
pub use error::{ErrorKind, GeoFireError, Result};
pub use events::{EventStream, GeoEvent, QueryEvent};
pub use geofire::GeoFire;
pub use geohash::{covering_ranges, GeoHash, HashRange};
#[cfg(feature = "aof")]
pub use persistence::AofBackend;
pub use protocol::{Command, Reply, Response};
pub use query::{GeoQuery, Observer, QueryId, QueryState};
pub use session::{QueryHandle, SessionManager};
pub use spatial::{BoundingBox, Location};
pub use storage::{ChangeCallback, Entry, LocationBackend, MemoryBackend, SubscriptionId};
pub use store::LocationStore;
pub use tracker::{ChangeTracker, Transition};
pub use types::{Config, ModePolicy, QueryMode, RetryPolicy, SyncPolicy};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        Config, GeoEvent, GeoFire, GeoFireError, GeoHash, GeoQuery, Location, QueryEvent,
        QueryHandle, QueryMode, Result,
    };
}

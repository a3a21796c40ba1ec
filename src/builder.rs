//! Builder for [`GeoFire`] instances
//!
//! This module provides a builder pattern for choosing the backing store and
//! configuration of a GeoFire instance.

use crate::error::Result;
use crate::geofire::GeoFire;
use crate::storage::{LocationBackend, MemoryBackend};
use crate::types::Config;
use log::info;
#[cfg(feature = "aof")]
use std::path::PathBuf;
use std::sync::Arc;

enum BackendChoice {
    Memory,
    #[cfg(feature = "aof")]
    Aof(PathBuf),
    Custom(Arc<dyn LocationBackend>),
}

/// Builder for creating GeoFire instances.
///
/// By default the store is in memory. Use `aof_path()` for a durable store
/// or `backend()` to plug in another [`LocationBackend`].
///
/// # Examples
///
/// ## Durable store
/// ```rust
/// use geofire::GeoFireBuilder;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let temp_path = std::env::temp_dir().join("geofire_builder_doc.aof");
/// let geofire = GeoFireBuilder::new().aof_path(&temp_path).build()?;
/// drop(geofire);
/// # std::fs::remove_file(temp_path)?;
/// # Ok(())
/// # }
/// ```
///
/// ## Full configuration
/// ```rust
/// use geofire::{Config, GeoFireBuilder, ModePolicy};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::with_precision(8).with_mode_policy(ModePolicy::Exclusive);
/// let geofire = GeoFireBuilder::new().in_memory().config(config).build()?;
/// assert_eq!(geofire.config().precision, 8);
/// # Ok(())
/// # }
/// ```
pub struct GeoFireBuilder {
    backend: BackendChoice,
    config: Config,
}

impl GeoFireBuilder {
    pub fn new() -> Self {
        Self {
            backend: BackendChoice::Memory,
            config: Config::default(),
        }
    }

    /// Persist to an append-only file at `path`, replaying it on build.
    #[cfg(feature = "aof")]
    pub fn aof_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.backend = BackendChoice::Aof(path.into());
        self
    }

    /// Keep everything in memory.
    pub fn in_memory(mut self) -> Self {
        self.backend = BackendChoice::Memory;
        self
    }

    /// Use a caller-provided backing store.
    pub fn backend(mut self, backend: Arc<dyn LocationBackend>) -> Self {
        self.backend = BackendChoice::Custom(backend);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<GeoFire> {
        self.config.validate()?;
        let backend: Arc<dyn LocationBackend> = match self.backend {
            BackendChoice::Memory => {
                info!("[GeoFire] opening in-memory store");
                Arc::new(MemoryBackend::new())
            }
            #[cfg(feature = "aof")]
            BackendChoice::Aof(path) => {
                Arc::new(crate::persistence::AofBackend::open(&path, &self.config)?)
            }
            BackendChoice::Custom(backend) => backend,
        };
        GeoFire::with_backend(backend, self.config)
    }
}

impl Default for GeoFireBuilder {
    fn default() -> Self {
        Self::new()
    }
}

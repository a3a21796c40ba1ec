use crate::error::{GeoFireError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of geohash characters stored per entry.
pub const DEFAULT_PRECISION: usize = 10;

/// Synchronization policy for the durable backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Hand writes to the OS without fsync (fastest, least safe)
    Never,
    /// Fsync after every write before reporting success
    #[default]
    Always,
}

/// How the session manager treats the two observation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModePolicy {
    /// A locations-only and a locations+data query may run side by side,
    /// each with its own geometry
    #[default]
    Independent,
    /// Starting a query of either mode tears down every active query
    Exclusive,
}

/// What a query reports for each matched identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Identifier and location only
    Locations,
    /// Identifier, location and the attached payload
    LocationsWithData,
}

impl QueryMode {
    pub fn carries_data(self) -> bool {
        matches!(self, QueryMode::LocationsWithData)
    }
}

/// Backoff schedule for transient store failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 25,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that surfaces the first failure.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Geohash characters stored per entry (1-12)
    pub precision: usize,

    /// How the durable backend syncs writes to disk
    pub sync_policy: SyncPolicy,

    /// Log size that triggers compaction of the durable backend
    pub rewrite_size_threshold: u64,

    /// Upper bound on the time spent on one store call, retries included
    pub store_timeout_ms: u64,

    /// Backoff for transient scan/watch failures
    pub retry: RetryPolicy,

    /// Whether both observation modes may be active at once
    pub mode_policy: ModePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            sync_policy: SyncPolicy::default(),
            rewrite_size_threshold: 64 * 1024 * 1024, // 64MB
            store_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
            mode_policy: ModePolicy::default(),
        }
    }
}

impl Config {
    pub fn with_precision(precision: usize) -> Self {
        Self {
            precision,
            ..Self::default()
        }
    }

    pub fn with_sync_policy(mut self, sync_policy: SyncPolicy) -> Self {
        self.sync_policy = sync_policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_mode_policy(mut self, mode_policy: ModePolicy) -> Self {
        self.mode_policy = mode_policy;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_rewrite_size_threshold(mut self, bytes: u64) -> Self {
        self.rewrite_size_threshold = bytes;
        self
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.precision == 0 || self.precision > crate::geohash::MAX_PRECISION {
            return Err(GeoFireError::invalid(format!(
                "precision must be between 1 and {}, got {}",
                crate::geohash::MAX_PRECISION,
                self.precision
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(GeoFireError::invalid("retry.max_attempts must be at least 1"));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(GeoFireError::invalid("retry.multiplier must be >= 1.0"));
        }
        if self.store_timeout_ms == 0 {
            return Err(GeoFireError::invalid("store_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Parse a configuration from TOML, filling unspecified fields with defaults.
    #[cfg(feature = "toml")]
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| GeoFireError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

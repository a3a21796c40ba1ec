use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for GeoFire operations
#[derive(Debug, Error)]
pub enum GeoFireError {
    /// Bad coordinates, non-positive radius, malformed identifier or hash
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Get or remove on an identifier the store does not hold
    #[error("Not found: {0}")]
    NotFound(String),
    /// Backing store unreachable or timed out
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// Operation on a query that has already been stopped
    #[error("Query already stopped")]
    AlreadyStopped,
    /// Lock acquisition failed
    #[error("Failed to acquire lock: {0}")]
    Lock(String),
    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// I/O error from persistence layer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializable error tag used when errors cross the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Unavailable,
    AlreadyStopped,
    Internal,
}

impl GeoFireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GeoFireError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            GeoFireError::NotFound(_) => ErrorKind::NotFound,
            GeoFireError::Unavailable(_) => ErrorKind::Unavailable,
            GeoFireError::AlreadyStopped => ErrorKind::AlreadyStopped,
            GeoFireError::Lock(_) | GeoFireError::Serialization(_) | GeoFireError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GeoFireError::Unavailable(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        GeoFireError::InvalidArgument(msg.into())
    }
}

impl From<serde_json::Error> for GeoFireError {
    fn from(err: serde_json::Error) -> Self {
        GeoFireError::Serialization(err.to_string())
    }
}

#[cfg(feature = "aof")]
impl From<bincode::Error> for GeoFireError {
    fn from(err: bincode::Error) -> Self {
        GeoFireError::Serialization(err.to_string())
    }
}

/// Result type alias for GeoFire operations
pub type Result<T> = std::result::Result<T, GeoFireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            GeoFireError::invalid("radius").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            GeoFireError::NotFound("a".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(GeoFireError::AlreadyStopped.kind(), ErrorKind::AlreadyStopped);
        assert_eq!(
            GeoFireError::Lock("poisoned".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(GeoFireError::Unavailable("timeout".into()).is_transient());
        assert!(!GeoFireError::NotFound("a".into()).is_transient());
        assert!(!GeoFireError::AlreadyStopped.is_transient());
    }

    #[test]
    fn test_display() {
        let err = GeoFireError::invalid("radius must be positive");
        assert_eq!(err.to_string(), "Invalid argument: radius must be positive");
    }
}

//! Query events and the single-subscriber event stream.

use crate::error::ErrorKind;
use crate::query::QueryId;
use crate::spatial::Location;
use crate::types::QueryMode;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// What happened to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "callBack", rename_all = "camelCase")]
pub enum GeoEvent {
    /// Initial (or post-update) scan finished; `matched` is the inside-set.
    Ready { matched: Vec<String> },
    Entered {
        id: String,
        location: Location,
        data: Option<Value>,
    },
    Moved {
        id: String,
        location: Location,
        data: Option<Value>,
    },
    /// Payload changed while the location stayed put (data mode only).
    Changed {
        id: String,
        location: Location,
        data: Option<Value>,
    },
    Exited {
        id: String,
        #[serde(rename = "lastLocation")]
        last_location: Option<Location>,
        data: Option<Value>,
    },
    Error { kind: ErrorKind, message: String },
}

impl GeoEvent {
    /// The identifier the event is about, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            GeoEvent::Entered { id, .. }
            | GeoEvent::Moved { id, .. }
            | GeoEvent::Changed { id, .. }
            | GeoEvent::Exited { id, .. } => Some(id),
            GeoEvent::Ready { .. } | GeoEvent::Error { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GeoEvent::Ready { .. } => "ready",
            GeoEvent::Entered { .. } => "entered",
            GeoEvent::Moved { .. } => "moved",
            GeoEvent::Changed { .. } => "changed",
            GeoEvent::Exited { .. } => "exited",
            GeoEvent::Error { .. } => "error",
        }
    }
}

/// An event tagged with the query that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEvent {
    pub query: QueryId,
    pub mode: QueryMode,
    #[serde(flatten)]
    pub event: GeoEvent,
}

/// One ordered event channel with at most one subscriber.
///
/// Listening again replaces the previous subscriber; its receiver sees the
/// channel close. Events emitted while nobody listens are dropped.
#[derive(Clone, Default)]
pub struct EventStream {
    sink: Arc<Mutex<Option<Sender<QueryEvent>>>>,
}

impl EventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the subscriber, replacing any previous one.
    pub fn listen(&self) -> Receiver<QueryEvent> {
        let (tx, rx) = mpsc::channel();
        match self.sink.lock() {
            Ok(mut sink) => {
                if sink.replace(tx).is_some() {
                    info!("[EventStream] subscriber replaced");
                }
            }
            Err(_) => error!("[EventStream] sink lock poisoned, subscriber not installed"),
        }
        rx
    }

    /// Drop the subscriber; returns whether one was installed.
    pub fn cancel(&self) -> bool {
        match self.sink.lock() {
            Ok(mut sink) => sink.take().is_some(),
            Err(_) => false,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.sink.lock().map(|sink| sink.is_some()).unwrap_or(false)
    }

    /// Deliver an event; returns whether a subscriber received it.
    pub(crate) fn emit(&self, event: QueryEvent) -> bool {
        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(_) => {
                error!("[EventStream] sink lock poisoned, dropping {}", event.event.name());
                return false;
            }
        };
        let Some(tx) = sink.as_ref() else {
            debug!(
                "[EventStream] no subscriber, dropping {} for query {}",
                event.event.name(),
                event.query
            );
            return false;
        };
        if tx.send(event).is_err() {
            debug!("[EventStream] subscriber went away");
            *sink = None;
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ready(query: QueryId) -> QueryEvent {
        QueryEvent {
            query,
            mode: QueryMode::Locations,
            event: GeoEvent::Ready { matched: vec![] },
        }
    }

    #[test]
    fn test_emit_without_subscriber_drops() {
        let stream = EventStream::new();
        assert!(!stream.is_listening());
        assert!(!stream.emit(ready(QueryId::new())));
    }

    #[test]
    fn test_new_subscriber_replaces_old() {
        let stream = EventStream::new();
        let first = stream.listen();
        let second = stream.listen();
        assert!(stream.emit(ready(QueryId::new())));

        assert!(second.try_recv().is_ok());
        // The first receiver's sender was dropped on replacement
        assert!(matches!(
            first.try_recv(),
            Err(mpsc::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_cancel_and_dropped_receiver() {
        let stream = EventStream::new();
        let rx = stream.listen();
        assert!(stream.cancel());
        assert!(!stream.cancel());
        assert!(rx.try_recv().is_err());

        let rx = stream.listen();
        drop(rx);
        assert!(!stream.emit(ready(QueryId::new())));
        assert!(!stream.is_listening());
    }

    #[test]
    fn test_event_serialization() {
        let event = GeoEvent::Entered {
            id: "a".into(),
            location: Location::new(1.0, 2.0).unwrap(),
            data: Some(json!({"seats": 3})),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["callBack"], "entered");
        assert_eq!(value["id"], "a");
        assert_eq!(value["location"]["latitude"], 1.0);
        assert_eq!(value["data"]["seats"], 3);

        let exited = GeoEvent::Exited {
            id: "a".into(),
            last_location: None,
            data: None,
        };
        let value = serde_json::to_value(&exited).unwrap();
        assert_eq!(value["callBack"], "exited");
        assert!(value["lastLocation"].is_null());
    }
}

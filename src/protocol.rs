//! JSON command protocol for transports sitting in front of a session.
//!
//! Requests are tagged by `method`, responses by `status`. Failures come
//! back as `{"status": "error", "kind": ..., "message": ...}`; nothing is
//! thrown across the boundary.

use crate::error::{ErrorKind, GeoFireError, Result};
use crate::session::{QueryHandle, SessionManager};
use crate::spatial::Location;
use crate::types::QueryMode;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Command {
    StartQuery {
        center: Location,
        radius: f64,
        #[serde(default = "default_mode")]
        mode: QueryMode,
    },
    /// Without a mode, every active query is updated. A failed update leaves
    /// that query on its previous circle; the others still move and the
    /// first failure is returned.
    UpdateQuery {
        center: Location,
        radius: f64,
        #[serde(default)]
        mode: Option<QueryMode>,
    },
    /// Without a mode, every active query is stopped.
    StopQuery {
        #[serde(default)]
        mode: Option<QueryMode>,
    },
    SetLocation {
        id: String,
        location: Location,
        #[serde(default)]
        data: Option<Value>,
    },
    RemoveLocation {
        id: String,
    },
    GetLocation {
        id: String,
    },
    ComputeHash {
        location: Location,
        precision: usize,
    },
}

fn default_mode() -> QueryMode {
    QueryMode::Locations
}

/// Successful results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reply {
    Query(QueryHandle),
    Done,
    /// Number of queries affected
    Queries(usize),
    Location(Option<Location>),
    Hash(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Response {
    Ok { result: Reply },
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

impl From<Result<Reply>> for Response {
    fn from(result: Result<Reply>) -> Self {
        match result {
            Ok(result) => Response::Ok { result },
            Err(err) => Response::Error {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }
}

impl SessionManager {
    /// Execute one command.
    pub fn dispatch(&self, command: Command) -> Response {
        let result = self.execute(command);
        if let Err(ref err) = result {
            warn!("[Session] command failed: {}", err);
        }
        result.into()
    }

    /// Parse a JSON request, execute it and serialise the response.
    pub fn dispatch_json(&self, request: &str) -> String {
        let response = match serde_json::from_str::<Command>(request) {
            Ok(command) => self.dispatch(command),
            Err(err) => Response::Error {
                kind: ErrorKind::InvalidArgument,
                message: format!("malformed request: {}", err),
            },
        };
        serde_json::to_string(&response).unwrap_or_else(|err| {
            format!(
                r#"{{"status":"error","kind":"internal","message":"{}"}}"#,
                err.to_string().replace('"', "'")
            )
        })
    }

    fn execute(&self, command: Command) -> Result<Reply> {
        match command {
            Command::StartQuery {
                center,
                radius,
                mode,
            } => self.start_query(center, radius, mode).map(Reply::Query),
            Command::UpdateQuery {
                center,
                radius,
                mode,
            } => {
                let handles = self.handles_for(mode)?;
                let mut first_error = None;
                for handle in &handles {
                    if let Err(err) = self.update_query(handle, center, radius) {
                        warn!("[Protocol] update of {:?} query failed: {}", handle.mode, err);
                        first_error.get_or_insert(err);
                    }
                }
                first_error.map_or(Ok(Reply::Queries(handles.len())), Err)
            }
            Command::StopQuery { mode: Some(mode) } => {
                self.remove_listener(mode).map(|stopped| Reply::Queries(stopped as usize))
            }
            Command::StopQuery { mode: None } => self.stop_all().map(Reply::Queries),
            Command::SetLocation { id, location, data } => {
                self.set_location(&id, location, data).map(|_| Reply::Done)
            }
            Command::RemoveLocation { id } => self.remove_location(&id).map(|_| Reply::Done),
            Command::GetLocation { id } => self.get_location(&id).map(Reply::Location),
            Command::ComputeHash {
                location,
                precision,
            } => self
                .compute_hash(&location, precision)
                .map(|hash| Reply::Hash(hash.as_str().to_string())),
        }
    }

    fn handles_for(&self, mode: Option<QueryMode>) -> Result<Vec<QueryHandle>> {
        let handles = match mode {
            Some(mode) => self.active(mode)?.into_iter().collect(),
            None => self.active_handles()?,
        };
        if handles.is_empty() {
            return Err(GeoFireError::AlreadyStopped);
        }
        Ok(handles)
    }
}

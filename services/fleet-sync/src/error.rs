//! Error types for the fleet sync layer
//!
//! Two families live here. `FleetSyncError` covers infrastructure faults
//! (config, storage, serving). `ClassifiedError` is the typed result of a
//! backend call that did not succeed; it is a value, not a fault.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors raised by the layer's own infrastructure
#[derive(Debug, thiserror::Error)]
pub enum FleetSyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Action store error: {0}")]
    Store(String),

    #[error("Dashboard error: {0}")]
    Dashboard(String),
}

/// Result type alias for fleet sync operations
pub type Result<T> = std::result::Result<T, FleetSyncError>;

/// Failure taxonomy surfaced to callers of the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Feature not deployed on the backend. Never retried, never shown as an error.
    Unavailable,
    /// Retryable and time-bound.
    Transient,
    /// Contract or logic error. Not retried.
    Fatal,
    /// A queued mutation collided with newer server state.
    Conflict,
    /// The caller cancelled the request.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Unavailable => write!(f, "unavailable"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Fatal => write!(f, "fatal"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A classified failure of a backend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} failure on '{endpoint}': {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub endpoint: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Server's current state, present for conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_state: Option<serde_json::Value>,
}

impl ClassifiedError {
    fn new(kind: ErrorKind, retryable: bool, endpoint: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable,
            endpoint: endpoint.to_string(),
            message: message.into(),
            status_code: None,
            server_state: None,
        }
    }

    pub fn unavailable(endpoint: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, false, endpoint, message)
    }

    pub fn transient(endpoint: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, true, endpoint, message)
    }

    pub fn fatal(endpoint: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, false, endpoint, message)
    }

    pub fn conflict(
        endpoint: &str,
        message: impl Into<String>,
        server_state: serde_json::Value,
    ) -> Self {
        let mut error = Self::new(ErrorKind::Conflict, false, endpoint, message);
        error.server_state = Some(server_state);
        error
    }

    pub fn cancelled(endpoint: &str) -> Self {
        Self::new(ErrorKind::Cancelled, false, endpoint, "request cancelled")
    }

    pub fn with_status(mut self, status_code: Option<u16>) -> Self {
        self.status_code = status_code;
        self
    }
}

//! Availability classifier
//!
//! Pure functions from a transport outcome (plus per-endpoint policy) to a
//! verdict. No side effects; cancelled attempts never reach this module.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClassifiedError;
use crate::io::{OutcomeKind, RequestOutcome};

/// Envelope codes that mean "this backend does not implement the feature"
const NOT_IMPLEMENTED_CODES: &[&str] = &["not_implemented", "feature_unavailable"];

/// Verdict derived from one transport outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Ok,
    FeatureUnavailable,
    Transient,
    Fatal,
}

/// What a 404 means for an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundPolicy {
    /// Feature not deployed: show nothing and stop polling
    #[default]
    Unavailable,
    /// Resource missing: a normal, empty success
    Empty,
}

/// Endpoint-specific classification policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointPolicy {
    #[serde(default)]
    pub not_found: NotFoundPolicy,
}

impl EndpointPolicy {
    pub fn not_found_is_empty() -> Self {
        Self {
            not_found: NotFoundPolicy::Empty,
        }
    }
}

/// Structured error envelope returned by the backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub retryable: Option<bool>,
    #[serde(default)]
    pub retry_after_seconds: Option<u64>,
}

/// Classify a transport outcome
pub fn classify(outcome: &RequestOutcome, policy: &EndpointPolicy) -> Verdict {
    match outcome.kind {
        OutcomeKind::Timeout | OutcomeKind::NetworkError => return Verdict::Transient,
        OutcomeKind::Success | OutcomeKind::HttpError => {}
    }

    let Some(status) = outcome.status_code else {
        return Verdict::Fatal;
    };

    let envelope = error_envelope(outcome);
    if envelope
        .as_ref()
        .and_then(|e| e.code.as_deref())
        .is_some_and(|code| NOT_IMPLEMENTED_CODES.contains(&code))
    {
        return Verdict::FeatureUnavailable;
    }

    match status {
        404 => match policy.not_found {
            NotFoundPolicy::Unavailable => Verdict::FeatureUnavailable,
            NotFoundPolicy::Empty => Verdict::Ok,
        },
        501 => Verdict::FeatureUnavailable,
        200..=299 => match body_text(outcome) {
            None => Verdict::Ok,
            Some(text) if serde_json::from_str::<Value>(text).is_ok() => Verdict::Ok,
            Some(_) => Verdict::Fatal,
        },
        400..=599 => match envelope.and_then(|e| e.retryable) {
            Some(true) => Verdict::Transient,
            Some(false) => Verdict::Fatal,
            None if status >= 500 || status == 408 || status == 429 => Verdict::Transient,
            None => Verdict::Fatal,
        },
        _ => Verdict::Fatal,
    }
}

/// Extract the data payload of an `Ok` outcome
///
/// A JSON object carrying a `data` key is unwrapped to that value. Empty
/// bodies and policy-empty 404s yield `Value::Null`.
pub fn payload(
    endpoint: &str,
    outcome: &RequestOutcome,
) -> std::result::Result<Value, ClassifiedError> {
    if outcome.status_code == Some(404) {
        return Ok(Value::Null);
    }
    let Some(text) = body_text(outcome) else {
        return Ok(Value::Null);
    };
    let value: Value = serde_json::from_str(text).map_err(|e| {
        ClassifiedError::fatal(endpoint, format!("malformed response body: {}", e))
            .with_status(outcome.status_code)
    })?;
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            Ok(map.remove("data").unwrap_or(Value::Null))
        }
        other => Ok(other),
    }
}

/// Parse the structured error envelope, if the body carries one
pub fn error_envelope(outcome: &RequestOutcome) -> Option<ErrorEnvelope> {
    let text = body_text(outcome)?;
    let value: Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;
    if !object.contains_key("code") && !object.contains_key("message") {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Server-suggested delay before the next attempt
pub fn retry_after_hint(outcome: &RequestOutcome) -> Option<Duration> {
    error_envelope(outcome)
        .and_then(|e| e.retry_after_seconds)
        .map(Duration::from_secs)
}

/// Server state reported by a conflict-shaped 409 body
pub fn conflict_state(outcome: &RequestOutcome) -> Option<Value> {
    if outcome.status_code != Some(409) {
        return None;
    }
    let value: Value = serde_json::from_str(body_text(outcome)?).ok()?;
    let object = value.as_object()?;
    object
        .get("current_state")
        .or_else(|| object.get("state"))
        .cloned()
}

/// Build the caller-facing error for a non-`Ok` verdict
pub fn to_error(endpoint: &str, verdict: Verdict, outcome: &RequestOutcome) -> ClassifiedError {
    let message = error_envelope(outcome)
        .and_then(|e| e.message)
        .unwrap_or_else(|| outcome.to_string());
    let error = match verdict {
        Verdict::FeatureUnavailable => ClassifiedError::unavailable(endpoint, message),
        Verdict::Transient => ClassifiedError::transient(endpoint, message),
        Verdict::Fatal | Verdict::Ok => match conflict_state(outcome) {
            Some(server_state) => ClassifiedError::conflict(endpoint, message, server_state),
            None => ClassifiedError::fatal(endpoint, message),
        },
    };
    error.with_status(outcome.status_code)
}

fn body_text(outcome: &RequestOutcome) -> Option<&str> {
    outcome
        .body
        .as_deref()
        .map(str::trim)
        .filter(|body| !body.is_empty())
}

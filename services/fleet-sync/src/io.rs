//! Transport: single HTTP requests and single streamed connections
//!
//! Nothing in this module retries or applies policy. Every attempt produces
//! a `RequestOutcome`; network failures and timeouts are outcomes, not errors.
//! Cancellation happens by dropping the in-flight future, which aborts the
//! underlying socket.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FleetSyncError, Result};

/// Raw kind of a transport attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    HttpError,
    NetworkError,
    Timeout,
}

/// Result of one transport attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub kind: OutcomeKind,
    pub status_code: Option<u16>,
    pub body: Option<String>,
    /// Human readable detail for network-level failures
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

impl RequestOutcome {
    /// Build an outcome from a received HTTP response
    pub fn from_status(status: u16, body: impl Into<String>, elapsed_ms: u64) -> Self {
        let kind = if (200..300).contains(&status) {
            OutcomeKind::Success
        } else {
            OutcomeKind::HttpError
        };
        Self {
            kind,
            status_code: Some(status),
            body: Some(body.into()),
            detail: None,
            elapsed_ms,
        }
    }

    pub fn network_error(detail: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            kind: OutcomeKind::NetworkError,
            status_code: None,
            body: None,
            detail: Some(detail.into()),
            elapsed_ms,
        }
    }

    pub fn timeout(elapsed_ms: u64) -> Self {
        Self {
            kind: OutcomeKind::Timeout,
            status_code: None,
            body: None,
            detail: None,
            elapsed_ms,
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OutcomeKind::Success | OutcomeKind::HttpError => match self.status_code {
                Some(status) => write!(f, "HTTP {}", status),
                None => write!(f, "HTTP response without status"),
            },
            OutcomeKind::NetworkError => write!(
                f,
                "network error: {}",
                self.detail.as_deref().unwrap_or("unknown")
            ),
            OutcomeKind::Timeout => write!(f, "timed out after {} ms", self.elapsed_ms),
        }
    }
}

/// HTTP method of an API request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// A request against the backend, relative to its base URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            body: None,
            idempotency_key: None,
        }
    }
}

/// Abstraction over a single HTTP attempt for dependency injection
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait HttpTransport: Send + Sync {
    /// Issue one request. Never retries.
    async fn execute(&self, request: &ApiRequest) -> RequestOutcome;
}

/// Production transport using reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Create a transport with a fixed per-request timeout
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FleetSyncError::Http(format!("Building HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> RequestOutcome {
        let url = self.url(&request.path);
        tracing::debug!("{} {}", request.method, url);
        let started = Instant::now();

        let mut builder = self.client.request(request.method.as_reqwest(), &url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(key) = &request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return outcome_from_error(&e, elapsed_ms(started)),
        };

        let status = response.status().as_u16();
        let outcome = match response.text().await {
            Ok(body) => RequestOutcome::from_status(status, body, elapsed_ms(started)),
            Err(e) => outcome_from_error(&e, elapsed_ms(started)),
        };

        tracing::debug!("{} {} -> {}", request.method, url, outcome);
        outcome
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{}{}", base_url, path)
    } else {
        format!("{}/{}", base_url, path)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn outcome_from_error(error: &reqwest::Error, elapsed_ms: u64) -> RequestOutcome {
    if error.is_timeout() {
        RequestOutcome::timeout(elapsed_ms)
    } else {
        RequestOutcome::network_error(error.to_string(), elapsed_ms)
    }
}

// ============================================================================
// Streamed connections
// ============================================================================

/// Trait for reading newline-delimited records from an open stream
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait LineReader: Send {
    /// Read the next line
    ///
    /// Returns `Ok(Some(line))` for a record, `Ok(None)` when the stream
    /// ended, or an error if reading failed. Both of the latter are drops.
    async fn read_line(&mut self) -> Result<Option<String>>;
}

/// Result of a stream handshake
pub enum Handshake {
    Open(Box<dyn LineReader>),
    Rejected(RequestOutcome),
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handshake::Open(_) => write!(f, "Handshake::Open"),
            Handshake::Rejected(outcome) => write!(f, "Handshake::Rejected({})", outcome),
        }
    }
}

/// Opens a single event-stream connection
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Whether the backend honours resumption from a last event id
    fn supports_resume(&self) -> bool;

    /// Open the stream, optionally resuming after `resume_from`
    async fn connect(&self, resume_from: Option<String>) -> Handshake;

    /// Fetch a snapshot of recent events, if the backend offers one
    async fn snapshot(&self) -> Option<RequestOutcome>;
}

/// Line reader over a streamed reqwest response body
pub struct ResponseLineReader {
    response: reqwest::Response,
    buffer: Vec<u8>,
}

impl ResponseLineReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: Vec::new(),
        }
    }
}

#[async_trait]
impl LineReader for ResponseLineReader {
    async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                return Ok(Some(line));
            }

            let chunk = self
                .response
                .chunk()
                .await
                .map_err(|e| FleetSyncError::Http(format!("Reading event stream: {}", e)))?;

            match chunk {
                Some(bytes) => self.buffer.extend_from_slice(&bytes),
                None if self.buffer.is_empty() => return Ok(None),
                None => {
                    let rest = std::mem::take(&mut self.buffer);
                    return Ok(Some(String::from_utf8_lossy(&rest).trim().to_string()));
                }
            }
        }
    }
}

/// Split the first complete line off the buffer
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.iter().position(|b| *b == b'\n')?;
    let line: Vec<u8> = buffer.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&line).trim().to_string())
}

/// Event-stream connector over HTTP, emitting newline-delimited JSON
pub struct HttpStreamConnector {
    client: reqwest::Client,
    url: String,
    resume: bool,
    snapshot: Option<(Arc<dyn HttpTransport>, ApiRequest)>,
}

impl HttpStreamConnector {
    /// Create a connector. Only the connect phase is time-limited; the
    /// stream itself is long-lived.
    pub fn new(
        base_url: &str,
        path: &str,
        connect_timeout: Duration,
        resume: bool,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| FleetSyncError::Http(format!("Building stream client: {}", e)))?;
        Ok(Self {
            client,
            url: join_url(base_url.trim_end_matches('/'), path),
            resume,
            snapshot: None,
        })
    }

    /// Fetch snapshots through `transport` when resumption is unavailable
    pub fn with_snapshot(mut self, transport: Arc<dyn HttpTransport>, path: &str) -> Self {
        self.snapshot = Some((transport, ApiRequest::get(path)));
        self
    }
}

#[async_trait]
impl StreamConnector for HttpStreamConnector {
    fn supports_resume(&self) -> bool {
        self.resume
    }

    async fn connect(&self, resume_from: Option<String>) -> Handshake {
        tracing::debug!(
            "Opening event stream {} (resume_from={:?})",
            self.url,
            resume_from
        );
        let started = Instant::now();

        let mut builder = self
            .client
            .get(&self.url)
            .header("Accept", "application/x-ndjson");
        if let Some(id) = &resume_from {
            builder = builder.header("Last-Event-ID", id);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Handshake::Rejected(outcome_from_error(&e, elapsed_ms(started))),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Handshake::Rejected(RequestOutcome::from_status(
                status.as_u16(),
                body,
                elapsed_ms(started),
            ));
        }

        tracing::debug!("Event stream {} open", self.url);
        Handshake::Open(Box::new(ResponseLineReader::new(response)))
    }

    async fn snapshot(&self) -> Option<RequestOutcome> {
        let (transport, request) = self.snapshot.as_ref()?;
        Some(transport.execute(request).await)
    }
}

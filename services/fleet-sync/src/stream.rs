//! Stream reconnector
//!
//! Keeps one long-lived event stream alive across drops. The state machine
//! is explicit: `StreamState::on` is a pure transition function and the
//! spawned driver only feeds it inputs.
//!
//! ```text
//! Idle -> Connecting -> Open -> (drop) -> Backoff -> Connecting -> ... -> Closed
//! ```

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::RetryPolicy;
use crate::classifier::{self, EndpointPolicy, Verdict};
use crate::io::{Handshake, LineReader, StreamConnector};

/// Why a stream stopped for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `close()` was called, or the consumer went away
    Caller,
    /// The backend does not offer the stream
    Unavailable,
    /// The handshake failed with a non-retryable error
    Fatal,
    /// Reconnection attempts ran out
    Exhausted,
}

/// Reconnector state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Connecting,
    Open,
    /// Waiting before reconnect; `attempt` counts consecutive failed handshakes
    Backoff { attempt: u32 },
    Closed(CloseReason),
}

/// Inputs driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInput {
    Start,
    HandshakeOk,
    HandshakeRejected(Verdict),
    Dropped,
    BackoffElapsed,
    AttemptsExhausted,
    Close,
}

impl StreamState {
    /// Apply one input. Inputs that make no sense in a state leave it unchanged.
    ///
    /// `failed_handshakes` is the reconnector's current attempt counter and
    /// only matters for transitions into `Backoff`.
    pub fn on(self, input: StreamInput, failed_handshakes: u32) -> StreamState {
        use StreamInput as I;
        use StreamState as S;

        match (self, input) {
            (S::Closed(_), _) => self,
            (_, I::Close) => S::Closed(CloseReason::Caller),
            (S::Idle, I::Start) => S::Connecting,
            (S::Connecting, I::HandshakeOk) => S::Open,
            (S::Connecting, I::HandshakeRejected(verdict)) => match verdict {
                Verdict::FeatureUnavailable => S::Closed(CloseReason::Unavailable),
                Verdict::Fatal => S::Closed(CloseReason::Fatal),
                Verdict::Transient | Verdict::Ok => S::Backoff {
                    attempt: failed_handshakes,
                },
            },
            (S::Open, I::Dropped) => S::Backoff {
                attempt: failed_handshakes,
            },
            (S::Backoff { .. }, I::BackoffElapsed) => S::Connecting,
            (S::Backoff { .. }, I::AttemptsExhausted) => S::Closed(CloseReason::Exhausted),
            _ => self,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed(_))
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::Connecting => write!(f, "connecting"),
            StreamState::Open => write!(f, "open"),
            StreamState::Backoff { attempt } => write!(f, "backoff (attempt {})", attempt),
            StreamState::Closed(reason) => write!(f, "closed ({:?})", reason),
        }
    }
}

/// One event from the stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub id: Option<String>,
    pub topic: Option<String>,
    pub data: Value,
}

impl StreamEvent {
    /// Parse an NDJSON record. `id` may be a string or a number.
    pub fn parse(line: &str) -> Option<StreamEvent> {
        let data: Value = serde_json::from_str(line).ok()?;
        Some(Self::from_value(data))
    }

    pub fn from_value(data: Value) -> StreamEvent {
        let id = match data.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let topic = data
            .get("topic")
            .or_else(|| data.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string);
        StreamEvent { id, topic, data }
    }
}

/// Resume and de-duplication bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCursor {
    pub last_event_id: Option<String>,
    pub last_seen_at_epoch_ms: u64,
    pub backoff_attempt: u32,
}

/// Bounded window of delivered event ids, oldest evicted first
#[derive(Debug)]
struct SeenIds {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Remember `id`; false if it was already seen
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

/// Event stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_path")]
    pub path: String,
    /// Whether the backend honours `Last-Event-ID`
    #[serde(default = "default_resume")]
    pub resume: bool,
    /// Recent-events endpoint used to reconcile when resumption is unsupported
    #[serde(default)]
    pub snapshot_path: Option<String>,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Backoff between reconnects; `max_attempts` 0 retries forever
    #[serde(default = "default_stream_retry")]
    pub retry: RetryPolicy,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            path: default_stream_path(),
            resume: default_resume(),
            snapshot_path: None,
            connect_timeout: default_connect_timeout(),
            retry: default_stream_retry(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

fn default_stream_path() -> String {
    "/api/events".to_string()
}

fn default_resume() -> bool {
    true
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stream_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 0,
        ..RetryPolicy::default()
    }
}

fn default_dedup_capacity() -> usize {
    1024
}

/// Caller's handle on a running reconnector
pub struct ReconnectorHandle {
    cancel: CancellationToken,
    state: watch::Receiver<StreamState>,
    cursor: Arc<Mutex<StreamCursor>>,
    task: JoinHandle<()>,
}

impl fmt::Debug for ReconnectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectorHandle")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl ReconnectorHandle {
    /// Stop immediately. No reconnection happens afterwards, whatever the
    /// current state.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    pub fn cursor(&self) -> StreamCursor {
        lock(&self.cursor).clone()
    }

    /// Wait for the driver task to finish and return the terminal state
    pub async fn closed(self) -> StreamState {
        if let Err(e) = self.task.await {
            warn!("Event stream task ended abnormally: {}", e);
        }
        *self.state.borrow()
    }
}

fn lock(cursor: &Mutex<StreamCursor>) -> MutexGuard<'_, StreamCursor> {
    cursor.lock().unwrap_or_else(PoisonError::into_inner)
}

fn current_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Drives one logical stream
pub struct Reconnector {
    connector: Arc<dyn StreamConnector>,
    retry: RetryPolicy,
    state: watch::Sender<StreamState>,
    cursor: Arc<Mutex<StreamCursor>>,
    seen: SeenIds,
    retry_hint: Option<Duration>,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl Reconnector {
    /// Start the stream in a background task
    ///
    /// Events are delivered on `events`; dropping its receiver closes the
    /// stream as if `close()` had been called.
    pub fn spawn(
        connector: Arc<dyn StreamConnector>,
        config: &StreamConfig,
        events: mpsc::Sender<StreamEvent>,
    ) -> ReconnectorHandle {
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let cursor = Arc::new(Mutex::new(StreamCursor::default()));
        let cancel = CancellationToken::new();
        let reconnector = Reconnector {
            connector,
            retry: config.retry.clone(),
            state: state_tx,
            cursor: Arc::clone(&cursor),
            seen: SeenIds::new(config.dedup_capacity),
            retry_hint: None,
            events,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(reconnector.run());
        ReconnectorHandle {
            cancel,
            state: state_rx,
            cursor,
            task,
        }
    }

    fn current(&self) -> StreamState {
        *self.state.borrow()
    }

    fn apply(&self, input: StreamInput) -> StreamState {
        let failed = lock(&self.cursor).backoff_attempt;
        let previous = self.current();
        let next = previous.on(input, failed);
        if next != previous {
            debug!("Event stream {} -> {} on {:?}", previous, next, input);
            self.state.send_replace(next);
        }
        next
    }

    async fn run(mut self) {
        let mut state = self.apply(StreamInput::Start);
        let mut reader: Option<Box<dyn LineReader>> = None;
        let mut has_been_open = false;

        loop {
            state = match state {
                StreamState::Idle => self.apply(StreamInput::Start),
                StreamState::Connecting => {
                    reader = self.connect(has_been_open).await;
                    has_been_open |= reader.is_some();
                    self.current()
                }
                StreamState::Open => match reader.take() {
                    Some(r) => self.pump(r).await,
                    None => self.apply(StreamInput::Dropped),
                },
                StreamState::Backoff { attempt } => self.backoff(attempt).await,
                StreamState::Closed(reason) => {
                    info!("Event stream closed ({:?})", reason);
                    break;
                }
            };
        }
    }

    /// Perform one handshake; returns the reader when the stream opened
    async fn connect(&mut self, reconnecting: bool) -> Option<Box<dyn LineReader>> {
        let resume_from = if self.connector.supports_resume() {
            lock(&self.cursor).last_event_id.clone()
        } else {
            None
        };
        let resuming = resume_from.is_some();

        let handshake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.apply(StreamInput::Close);
                return None;
            }
            handshake = self.connector.connect(resume_from) => handshake,
        };

        match handshake {
            Handshake::Open(reader) => {
                lock(&self.cursor).backoff_attempt = 0;
                self.apply(StreamInput::HandshakeOk);
                info!("Event stream open (resumed: {})", resuming);
                if reconnecting && !resuming {
                    self.reconcile_snapshot().await;
                }
                Some(reader)
            }
            Handshake::Rejected(outcome) => {
                let verdict = classifier::classify(&outcome, &EndpointPolicy::default());
                match verdict {
                    Verdict::FeatureUnavailable => {
                        info!("Event stream not offered by backend ({})", outcome)
                    }
                    Verdict::Fatal => warn!("Event stream handshake failed: {}", outcome),
                    Verdict::Transient | Verdict::Ok => {
                        debug!("Event stream handshake failed: {}", outcome);
                        lock(&self.cursor).backoff_attempt += 1;
                        self.retry_hint = classifier::retry_after_hint(&outcome);
                    }
                }
                self.apply(StreamInput::HandshakeRejected(verdict));
                None
            }
        }
    }

    /// Read until the connection drops, the caller closes, or the consumer goes away
    async fn pump(&mut self, mut reader: Box<dyn LineReader>) -> StreamState {
        loop {
            let line = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.apply(StreamInput::Close),
                line = reader.read_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    let Some(event) = StreamEvent::parse(&line) else {
                        warn!("Skipping unparseable stream record: {}", line);
                        continue;
                    };
                    if !self.deliver(event).await {
                        return self.apply(StreamInput::Close);
                    }
                }
                Ok(None) => {
                    info!("Event stream ended by server");
                    return self.apply(StreamInput::Dropped);
                }
                Err(e) => {
                    warn!("Event stream dropped: {}", e);
                    return self.apply(StreamInput::Dropped);
                }
            }
        }
    }

    async fn backoff(&mut self, attempt: u32) -> StreamState {
        if attempt > 0 && !self.retry.allows_another(attempt) {
            warn!("Event stream giving up after {} failed handshakes", attempt);
            return self.apply(StreamInput::AttemptsExhausted);
        }

        let delay = self.retry.delay_with_hint(attempt, self.retry_hint.take());
        debug!(
            "Event stream reconnecting in {:?} (attempt {})",
            delay, attempt + 1
        );

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => self.apply(StreamInput::Close),
            _ = tokio::time::sleep(delay) => self.apply(StreamInput::BackoffElapsed),
        }
    }

    /// Deliver events missed while disconnected, skipping ids already seen
    async fn reconcile_snapshot(&mut self) {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            outcome = self.connector.snapshot() => outcome,
        };
        let Some(outcome) = outcome else {
            debug!("No snapshot endpoint; events missed while disconnected are lost");
            return;
        };

        let verdict = classifier::classify(&outcome, &EndpointPolicy::not_found_is_empty());
        if verdict != Verdict::Ok {
            warn!("Event snapshot unavailable: {}", outcome);
            return;
        }
        let records = match classifier::payload("stream snapshot", &outcome) {
            Ok(Value::Array(records)) => records,
            Ok(Value::Null) => return,
            Ok(other) => {
                warn!("Event snapshot is not a list: {}", other);
                return;
            }
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        let mut delivered = 0usize;
        for record in records {
            let event = StreamEvent::from_value(record);
            if event.id.is_none() {
                debug!("Skipping snapshot event without id");
                continue;
            }
            if !self.is_new(&event) {
                continue;
            }
            if !self.deliver(event).await {
                return;
            }
            delivered += 1;
        }
        info!("Reconciled {} missed event(s) from snapshot", delivered);
    }

    fn is_new(&self, event: &StreamEvent) -> bool {
        event
            .id
            .as_deref()
            .is_none_or(|id| !self.seen.ids.contains(id))
    }

    /// Forward one event unless its id was already delivered. Returns false
    /// when the stream should stop.
    async fn deliver(&mut self, event: StreamEvent) -> bool {
        if let Some(id) = &event.id {
            if !self.seen.insert(id) {
                debug!("Dropping duplicate event '{}'", id);
                return true;
            }
        }
        {
            let mut cursor = lock(&self.cursor);
            if event.id.is_some() {
                cursor.last_event_id = event.id.clone();
            }
            cursor.last_seen_at_epoch_ms = current_epoch_ms();
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!("Event consumer went away");
                }
                sent.is_ok()
            }
        }
    }
}

//! BDD test world for fleet-sync

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cucumber::World;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

use fleet_sync::backoff::RetryPolicy;
use fleet_sync::dispatcher::Dispatcher;
use fleet_sync::io::{
    ApiRequest, Handshake, HttpTransport, LineReader, RequestOutcome, StreamConnector,
};
use fleet_sync::queue::{ActionQueue, FlushReport, SubmitOutcome};
use fleet_sync::section::SectionComposer;
use fleet_sync::stream::{ReconnectorHandle, StreamEvent, StreamState};
use fleet_sync::ClassifiedError;

/// Retry policy with delays short enough for tests
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_ratio: 0.0,
    }
}

/// Transport answering per path from a script, then from a fallback
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<ApiRequest>>,
}

#[derive(Debug, Default)]
struct Route {
    script: VecDeque<(u16, String)>,
    fallback: Option<(u16, String)>,
}

impl ScriptedTransport {
    /// Answer the next call to `path` with this response
    pub fn then(&self, path: &str, status: u16, body: &str) {
        self.route(path, |r| r.script.push_back((status, body.to_string())));
    }

    /// Answer every unscripted call to `path` with this response
    pub fn always(&self, path: &str, status: u16, body: &str) {
        self.route(path, |r| r.fallback = Some((status, body.to_string())));
    }

    fn route(&self, path: &str, f: impl FnOnce(&mut Route)) {
        let mut routes = self.routes.lock().unwrap();
        f(routes.entry(path.to_string()).or_default());
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: &ApiRequest) -> RequestOutcome {
        self.requests.lock().unwrap().push(request.clone());
        let answer = {
            let mut routes = self.routes.lock().unwrap();
            routes
                .get_mut(&request.path)
                .and_then(|r| r.script.pop_front().or_else(|| r.fallback.clone()))
        };
        match answer {
            Some((status, body)) => RequestOutcome::from_status(status, body, 1),
            None => RequestOutcome::network_error(format!("no route for {}", request.path), 1),
        }
    }
}

/// Reads scripted lines, then either ends or blocks until closed
pub struct ScriptedReader {
    lines: VecDeque<String>,
    hold_open: bool,
}

#[async_trait]
impl LineReader for ScriptedReader {
    async fn read_line(&mut self) -> fleet_sync::Result<Option<String>> {
        match self.lines.pop_front() {
            Some(line) => Ok(Some(line)),
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }
}

/// Stream connector serving one scripted connection per connect
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    pub resume: bool,
    connections: Mutex<VecDeque<Vec<String>>>,
    resume_requests: Mutex<Vec<Option<String>>>,
    snapshot: Mutex<Option<(u16, String)>>,
}

impl ScriptedConnector {
    pub fn new(resume: bool) -> Self {
        Self {
            resume,
            ..Self::default()
        }
    }

    /// Queue a connection that delivers events with these ids then drops
    pub fn connection(&self, ids: &[&str]) {
        let lines = ids
            .iter()
            .map(|id| serde_json::json!({"id": id, "topic": "cameras"}).to_string())
            .collect();
        self.connections.lock().unwrap().push_back(lines);
    }

    pub fn set_snapshot(&self, ids: &[&str]) {
        let events: Vec<Value> = ids
            .iter()
            .map(|id| serde_json::json!({"id": id, "topic": "cameras"}))
            .collect();
        *self.snapshot.lock().unwrap() = Some((200, Value::Array(events).to_string()));
    }

    pub fn resume_requests(&self) -> Vec<Option<String>> {
        self.resume_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    fn supports_resume(&self) -> bool {
        self.resume
    }

    async fn connect(&self, resume_from: Option<String>) -> Handshake {
        self.resume_requests.lock().unwrap().push(resume_from);
        let next = self.connections.lock().unwrap().pop_front();
        let reader = match next {
            Some(lines) => ScriptedReader {
                lines: lines.into(),
                hold_open: false,
            },
            // Out of script: stay connected with nothing to say
            None => ScriptedReader {
                lines: VecDeque::new(),
                hold_open: true,
            },
        };
        Handshake::Open(Box::new(reader))
    }

    async fn snapshot(&self) -> Option<RequestOutcome> {
        self.snapshot
            .lock()
            .unwrap()
            .clone()
            .map(|(status, body)| RequestOutcome::from_status(status, body, 1))
    }
}

#[derive(Default, World)]
pub struct FleetWorld {
    pub transport: Arc<ScriptedTransport>,
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub fetch_result: Option<Result<Option<Value>, ClassifiedError>>,

    // Sections
    pub composer: Option<SectionComposer>,

    // Action queue
    pub store_dir: Option<TempDir>,
    pub queue: Option<ActionQueue>,
    pub queued: HashMap<String, Uuid>,
    pub submit_outcome: Option<SubmitOutcome>,
    pub flush_report: Option<FlushReport>,

    // Stream
    pub connector: Option<Arc<ScriptedConnector>>,
    pub stream: Option<ReconnectorHandle>,
    pub events: Option<mpsc::Receiver<StreamEvent>>,
    pub delivered: Vec<String>,
    pub closed_state: Option<StreamState>,
}

impl fmt::Debug for FleetWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetWorld")
            .field("fetch_result", &self.fetch_result)
            .field("queued", &self.queued)
            .field("submit_outcome", &self.submit_outcome)
            .field("flush_report", &self.flush_report)
            .field("delivered", &self.delivered)
            .field("closed_state", &self.closed_state)
            .finish_non_exhaustive()
    }
}

impl FleetWorld {
    pub fn dispatcher(&mut self) -> Arc<Dispatcher> {
        Arc::clone(
            self.dispatcher
                .get_or_insert_with(|| Arc::new(Dispatcher::new(Default::default()))),
        )
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        self.transport.clone()
    }

    pub fn store_path(&mut self) -> std::path::PathBuf {
        self.store_dir
            .get_or_insert_with(|| TempDir::new().expect("failed to create temp dir"))
            .path()
            .to_path_buf()
    }
}

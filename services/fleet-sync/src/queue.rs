//! Offline action queue
//!
//! User-initiated mutations that could not be confirmed are persisted here
//! and replayed through the dispatcher once connectivity returns. Delivery
//! is at-least-once: replays carry the action id as `Idempotency-Key`.
//!
//! Every change to a record goes through `records`, a single async lock,
//! so enqueue and the background flush never race on the same record. A
//! second lock keeps flushes from overlapping.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::circuit::{CircuitEvent, CircuitPhase};
use crate::classifier::{EndpointPolicy, NotFoundPolicy};
use crate::dispatcher::{DispatchPolicy, Dispatcher};
use crate::error::{ClassifiedError, ErrorKind, FleetSyncError, Result};
use crate::io::{ApiRequest, HttpMethod, HttpTransport};
use crate::store::ActionStore;

/// Lifecycle of a queued action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Syncing,
    /// Confirmed by the backend but the record could not be deleted yet
    Synced,
    Failed,
    Conflicted,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStatus::Pending => write!(f, "pending"),
            ActionStatus::Syncing => write!(f, "syncing"),
            ActionStatus::Synced => write!(f, "synced"),
            ActionStatus::Failed => write!(f, "failed"),
            ActionStatus::Conflicted => write!(f, "conflicted"),
        }
    }
}

/// Local intent next to the server state it collided with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub attempted: Option<Value>,
    pub server_state: Value,
    pub message: String,
}

/// A mutation requested by the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
    /// Free-form label, e.g. `door.open`
    pub kind: String,
    /// Endpoint key; FIFO ordering holds within one key
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    pub path: String,
    #[serde(default)]
    pub payload: Option<Value>,
    /// How a 404 on this mutation is read; `empty` treats it as done
    #[serde(default)]
    pub not_found: NotFoundPolicy,
}

fn default_method() -> HttpMethod {
    HttpMethod::Post
}

/// Durable record of a mutation not yet confirmed by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: Uuid,
    pub kind: String,
    pub endpoint: String,
    pub method: HttpMethod,
    pub path: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub not_found: NotFoundPolicy,
    pub created_at_epoch_ms: u64,
    /// Tie-breaker for actions created in the same millisecond
    pub sequence: u64,
    pub status: ActionStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<ClassifiedError>,
    #[serde(default)]
    pub conflict: Option<ConflictRecord>,
}

impl QueuedAction {
    pub fn new(action: NewAction, sequence: u64) -> Self {
        Self::with_id(Uuid::new_v4(), action, sequence)
    }

    fn with_id(id: Uuid, action: NewAction, sequence: u64) -> Self {
        Self {
            id,
            kind: action.kind,
            endpoint: action.endpoint,
            method: action.method,
            path: action.path,
            payload: action.payload,
            not_found: action.not_found,
            created_at_epoch_ms: current_epoch_ms(),
            sequence,
            status: ActionStatus::Pending,
            retry_count: 0,
            last_error: None,
            conflict: None,
        }
    }

    /// Request used for replays; the id doubles as the idempotency key
    pub fn request(&self) -> ApiRequest {
        ApiRequest {
            method: self.method,
            path: self.path.clone(),
            body: self.payload.clone(),
            idempotency_key: Some(self.id.to_string()),
        }
    }

    fn policy(&self, retry: RetryPolicy) -> DispatchPolicy {
        DispatchPolicy::new(
            retry,
            EndpointPolicy {
                not_found: self.not_found,
            },
        )
    }

    fn is_queued(&self) -> bool {
        matches!(self.status, ActionStatus::Pending | ActionStatus::Syncing)
    }

    fn order_key(&self) -> (u64, u64) {
        (self.created_at_epoch_ms, self.sequence)
    }
}

fn current_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Action ids touched by one flush, by result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub synced: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub conflicted: Vec<Uuid>,
    /// Still pending: transient failure, open circuit, or held behind one
    pub held: Vec<Uuid>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.synced.is_empty()
            && self.failed.is_empty()
            && self.conflicted.is_empty()
            && self.held.is_empty()
    }
}

/// Operator decision on a failed or conflicted action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Put the action back in the queue with a fresh retry budget
    Retry,
    /// Drop the action
    Discard,
}

/// Result of `submit`
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Confirmed by the backend right away
    Sent(Value),
    /// Persisted for replay
    Queued(Uuid),
    /// Refused for a reason replaying would not fix
    Rejected(ClassifiedError),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No queued action with id {0}")]
    NotFound(Uuid),

    #[error("Action {id} is {status}; only failed or conflicted actions can be resolved")]
    NotResolvable { id: Uuid, status: ActionStatus },

    #[error(transparent)]
    Store(#[from] FleetSyncError),
}

/// Queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Directory for persisted actions; in-memory only when unset
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    /// Replays allowed before an action is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Periodic flush while online and something is pending
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Retry policy for immediate submits
    #[serde(default)]
    pub submit_retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            max_retries: default_max_retries(),
            flush_interval: default_flush_interval(),
            submit_retry: RetryPolicy::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(30)
}

enum Replay {
    Synced,
    Failed,
    Conflicted,
    Held,
    Cancelled,
}

struct Records {
    actions: HashMap<Uuid, QueuedAction>,
    next_sequence: u64,
}

impl Records {
    fn sorted(&self) -> Vec<QueuedAction> {
        let mut actions: Vec<QueuedAction> = self.actions.values().cloned().collect();
        actions.sort_by_key(QueuedAction::order_key);
        actions
    }
}

/// Durable queue of mutations awaiting backend confirmation
pub struct ActionQueue {
    store: Arc<dyn ActionStore>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn HttpTransport>,
    config: QueueConfig,
    records: Mutex<Records>,
    flushing: Mutex<()>,
    snapshot: watch::Sender<Vec<QueuedAction>>,
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("config", &self.config)
            .field("actions", &self.snapshot.borrow().len())
            .finish()
    }
}

impl ActionQueue {
    /// Load persisted actions and build the queue
    ///
    /// Records left `Syncing` by an interrupted flush go back to `Pending`.
    /// Records already `Synced` are deleted.
    pub async fn open(
        store: Arc<dyn ActionStore>,
        dispatcher: Arc<Dispatcher>,
        transport: Arc<dyn HttpTransport>,
        config: QueueConfig,
    ) -> Result<Self> {
        let mut actions = HashMap::new();
        let mut next_sequence = 0;

        for mut action in store.load_all().await? {
            match action.status {
                ActionStatus::Synced => {
                    store.remove(action.id).await?;
                    continue;
                }
                ActionStatus::Syncing => {
                    debug!(
                        "Action {} was interrupted mid-flush, re-queueing",
                        action.id
                    );
                    action.status = ActionStatus::Pending;
                    store.put(&action).await?;
                }
                _ => {}
            }
            next_sequence = next_sequence.max(action.sequence + 1);
            actions.insert(action.id, action);
        }

        let records = Records {
            actions,
            next_sequence,
        };
        let pending = records.actions.values().filter(|a| a.is_queued()).count();
        if !records.actions.is_empty() {
            info!(
                "Loaded {} queued action(s), {} pending",
                records.actions.len(), pending
            );
        }
        let (snapshot, _) = watch::channel(records.sorted());

        Ok(Self {
            store,
            dispatcher,
            transport,
            config,
            records: Mutex::new(records),
            flushing: Mutex::new(()),
            snapshot,
        })
    }

    /// Current records, oldest first
    pub fn snapshot(&self) -> Vec<QueuedAction> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<QueuedAction>> {
        self.snapshot.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.snapshot
            .borrow()
            .iter()
            .filter(|a| a.is_queued())
            .count()
    }

    fn publish(&self, records: &Records) {
        self.snapshot.send_replace(records.sorted());
    }

    /// Persist an action for replay. Durable before this returns.
    pub async fn enqueue(&self, action: NewAction) -> Result<Uuid> {
        self.enqueue_with_id(Uuid::new_v4(), action).await
    }

    async fn enqueue_with_id(&self, id: Uuid, action: NewAction) -> Result<Uuid> {
        let mut records = self.records.lock().await;
        let queued = QueuedAction::with_id(id, action, records.next_sequence);
        self.store.put(&queued).await?;
        records.next_sequence += 1;
        info!(
            "Queued {} for '{}' ({})",
            queued.kind, queued.endpoint, queued.id
        );
        records.actions.insert(queued.id, queued);
        self.publish(&records);
        Ok(id)
    }

    /// Send now if possible, otherwise queue
    ///
    /// Goes straight to the backend when `online`, the endpoint's circuit is
    /// not open and nothing is already queued for the endpoint. A transient
    /// failure falls back to the queue under the same id.
    pub async fn submit(
        &self,
        action: NewAction,
        online: bool,
        cancel: &CancellationToken,
    ) -> Result<SubmitOutcome> {
        let id = Uuid::new_v4();
        let circuit_open = self.dispatcher.circuits().phase(&action.endpoint) == CircuitPhase::Open;
        let backlog = self.has_queued(&action.endpoint).await;

        if !online || circuit_open || backlog {
            debug!(
                "Deferring {} for '{}' (online: {}, circuit open: {}, backlog: {})",
                action.kind, action.endpoint, online, circuit_open, backlog
            );
            return self
                .enqueue_with_id(id, action)
                .await
                .map(SubmitOutcome::Queued);
        }

        let request = ApiRequest {
            method: action.method,
            path: action.path.clone(),
            body: action.payload.clone(),
            idempotency_key: Some(id.to_string()),
        };
        let policy = DispatchPolicy::new(
            self.config.submit_retry.clone(),
            EndpointPolicy {
                not_found: action.not_found,
            },
        );
        let result = self
            .dispatcher
            .dispatch_exclusive(&action.endpoint, &policy, cancel, || {
                self.transport.execute(&request)
            })
            .await;

        match result {
            Ok(value) => Ok(SubmitOutcome::Sent(value)),
            Err(e) if e.kind == ErrorKind::Transient => {
                info!(
                    "{} for '{}' failed transiently, queueing: {}",
                    action.kind, action.endpoint, e
                );
                self.enqueue_with_id(id, action)
                    .await
                    .map(SubmitOutcome::Queued)
            }
            Err(e) => Ok(SubmitOutcome::Rejected(e)),
        }
    }

    async fn has_queued(&self, endpoint: &str) -> bool {
        let records = self.records.lock().await;
        records
            .actions
            .values()
            .any(|a| a.endpoint == endpoint && a.is_queued())
    }

    /// Replay pending actions; one flush runs at a time
    pub async fn flush(&self, cancel: &CancellationToken) -> FlushReport {
        let _flushing = self.flushing.lock().await;
        let mut report = FlushReport::default();

        let batches = self.pending_by_endpoint().await;
        if batches.is_empty() {
            return report;
        }
        let total: usize = batches.values().map(Vec::len).sum();
        info!(
            "Flushing {} pending action(s) across {} endpoint(s)",
            total, batches.len()
        );

        'endpoints: for (endpoint, actions) in batches {
            for (index, action) in actions.iter().enumerate() {
                let outcome = if self.dispatcher.circuits().phase(&endpoint) == CircuitPhase::Open {
                    debug!("Circuit for '{}' is open, holding its actions", endpoint);
                    Replay::Held
                } else {
                    self.replay(action, cancel).await
                };

                match outcome {
                    Replay::Synced => report.synced.push(action.id),
                    Replay::Failed => report.failed.push(action.id),
                    Replay::Conflicted => report.conflicted.push(action.id),
                    Replay::Held | Replay::Cancelled => {
                        report.held.extend(actions[index..].iter().map(|a| a.id));
                        if matches!(outcome, Replay::Cancelled) {
                            debug!("Flush cancelled");
                            break 'endpoints;
                        }
                        continue 'endpoints;
                    }
                }
            }
        }

        info!(
            "Flush done: {} synced, {} failed, {} conflicted, {} held",
            report.synced.len(), report.failed.len(), report.conflicted.len(), report.held.len()
        );
        report
    }

    async fn pending_by_endpoint(&self) -> BTreeMap<String, Vec<QueuedAction>> {
        let records = self.records.lock().await;
        let mut batches: BTreeMap<String, Vec<QueuedAction>> = BTreeMap::new();
        for action in records.sorted() {
            if action.status == ActionStatus::Pending {
                batches
                    .entry(action.endpoint.clone())
                    .or_default()
                    .push(action);
            }
        }
        batches
    }

    async fn replay(&self, action: &QueuedAction, cancel: &CancellationToken) -> Replay {
        if let Err(e) = self
            .update(action.id, |a| a.status = ActionStatus::Syncing)
            .await
        {
            warn!("Could not mark {} as syncing: {}", action.id, e);
            return Replay::Held;
        }

        let request = action.request();
        let policy = action.policy(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });
        let result = self
            .dispatcher
            .dispatch_exclusive(&action.endpoint, &policy, cancel, || {
                self.transport.execute(&request)
            })
            .await;

        let max_retries = self.config.max_retries;
        let (replay, update): (Replay, Box<dyn FnOnce(&mut QueuedAction) + Send>) = match result {
            Ok(_) => {
                return self.complete(action.id).await;
            }
            Err(e) => match e.kind {
                ErrorKind::Cancelled => (
                    Replay::Cancelled,
                    Box::new(|a: &mut QueuedAction| a.status = ActionStatus::Pending),
                ),
                ErrorKind::Transient => {
                    let exhausted = action.retry_count + 1 >= max_retries;
                    if exhausted {
                        warn!(
                            "Giving up on {} after {} replays: {}",
                            action.id, action.retry_count + 1, e
                        );
                    }
                    (
                        if exhausted { Replay::Failed } else { Replay::Held },
                        Box::new(move |a: &mut QueuedAction| {
                            a.retry_count += 1;
                            a.status = if exhausted {
                                ActionStatus::Failed
                            } else {
                                ActionStatus::Pending
                            };
                            a.last_error = Some(e);
                        }),
                    )
                }
                ErrorKind::Conflict => {
                    warn!(
                        "Conflict replaying {} on '{}': {}",
                        action.kind, action.endpoint, e.message
                    );
                    let conflict = ConflictRecord {
                        attempted: action.payload.clone(),
                        server_state: e.server_state.clone().unwrap_or(Value::Null),
                        message: e.message.clone(),
                    };
                    (
                        Replay::Conflicted,
                        Box::new(move |a: &mut QueuedAction| {
                            a.status = ActionStatus::Conflicted;
                            a.conflict = Some(conflict);
                            a.last_error = Some(e);
                        }),
                    )
                }
                ErrorKind::Unavailable | ErrorKind::Fatal => {
                    warn!("Replay of {} failed permanently: {}", action.id, e);
                    (
                        Replay::Failed,
                        Box::new(move |a: &mut QueuedAction| {
                            a.status = ActionStatus::Failed;
                            a.last_error = Some(e);
                        }),
                    )
                }
            },
        };

        if let Err(e) = self.update(action.id, update).await {
            warn!("Could not persist replay result for {}: {}", action.id, e);
        }
        replay
    }

    /// Drop a confirmed action
    async fn complete(&self, id: Uuid) -> Replay {
        let mut records = self.records.lock().await;
        match self.store.remove(id).await {
            Ok(()) => {
                records.actions.remove(&id);
                debug!("Action {} synced", id);
            }
            Err(e) => {
                warn!(
                    "Action {} synced but its record could not be removed: {}",
                    id, e
                );
                if let Some(action) = records.actions.get_mut(&id) {
                    action.status = ActionStatus::Synced;
                }
            }
        }
        self.publish(&records);
        Replay::Synced
    }

    async fn update(&self, id: Uuid, change: impl FnOnce(&mut QueuedAction)) -> Result<()> {
        let mut records = self.records.lock().await;
        let Some(current) = records.actions.get(&id) else {
            return Err(FleetSyncError::Store(format!("action {} disappeared", id)));
        };
        let mut updated = current.clone();
        change(&mut updated);
        self.store.put(&updated).await?;
        records.actions.insert(id, updated);
        self.publish(&records);
        Ok(())
    }

    /// Apply an operator decision to a failed or conflicted action
    pub async fn resolve(
        &self,
        id: Uuid,
        resolution: Resolution,
    ) -> std::result::Result<Option<QueuedAction>, ResolveError> {
        let mut records = self.records.lock().await;
        let action = records.actions.get(&id).ok_or(ResolveError::NotFound(id))?;
        if !matches!(
            action.status,
            ActionStatus::Failed | ActionStatus::Conflicted
        ) {
            return Err(ResolveError::NotResolvable {
                id,
                status: action.status,
            });
        }

        let resolved = match resolution {
            Resolution::Discard => {
                self.store.remove(id).await?;
                records.actions.remove(&id);
                info!("Discarded action {}", id);
                None
            }
            Resolution::Retry => {
                let mut retried = action.clone();
                retried.status = ActionStatus::Pending;
                retried.retry_count = 0;
                retried.last_error = None;
                retried.conflict = None;
                self.store.put(&retried).await?;
                records.actions.insert(id, retried.clone());
                info!("Re-queued action {}", id);
                Some(retried)
            }
        };
        self.publish(&records);
        Ok(resolved)
    }

    /// Flush on circuit recovery, on an offline to online edge, and
    /// periodically while online with work pending
    pub async fn run_flush_triggers(
        &self,
        mut circuit_events: broadcast::Receiver<CircuitEvent>,
        mut online: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) {
        let mut was_online = *online.borrow_and_update();
        let mut tick = tokio::time::interval(self.config.flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        if was_online && self.pending_count() > 0 {
            self.flush(&cancel).await;
        }

        loop {
            let should_flush = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Flush triggers stopped");
                    break;
                }
                event = circuit_events.recv() => match event {
                    Ok(CircuitEvent::Recovered { key }) => {
                        debug!("Circuit '{}' recovered", key);
                        true
                    }
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Missed {} circuit event(s)", skipped);
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Circuit events closed");
                        break;
                    }
                },
                changed = online.changed() => {
                    if changed.is_err() {
                        debug!("Connectivity signal closed");
                        break;
                    }
                    let now_online = *online.borrow_and_update();
                    let came_online = now_online && !was_online;
                    was_online = now_online;
                    if came_online {
                        info!("Back online");
                    }
                    came_online
                }
                _ = tick.tick() => was_online,
            };

            if should_flush && self.pending_count() > 0 {
                self.flush(&cancel).await;
            }
        }
    }
}

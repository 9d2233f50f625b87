//! Section composer
//!
//! Each dashboard section owns its own `SectionState` and poll loop. Sections
//! share the dispatcher (and so circuit state per endpoint) but never each
//! other's state: one section's failure cannot change another's phase.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchPolicy, Dispatcher};
use crate::error::{ClassifiedError, ErrorKind};
use crate::io::{ApiRequest, HttpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionPhase {
    Loading,
    Success,
    Empty,
    Error,
}

/// Why a section is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    /// The backend answered with nothing to show
    NoData,
    /// The backend does not offer this feature; the UI omits the section
    Unavailable,
}

/// Displayed state of one section
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionState<T> {
    pub phase: SectionPhase,
    /// Last good data; stays visible while loading and after errors
    pub data: Option<T>,
    pub error: Option<ClassifiedError>,
    pub empty_reason: Option<EmptyReason>,
    pub last_updated_at_epoch_ms: Option<u64>,
}

impl<T> SectionState<T> {
    pub fn loading() -> Self {
        Self {
            phase: SectionPhase::Loading,
            data: None,
            error: None,
            empty_reason: None,
            last_updated_at_epoch_ms: None,
        }
    }

    /// Whether the UI should offer a retry button
    pub fn retry_available(&self) -> bool {
        self.phase == SectionPhase::Error && self.error.as_ref().is_some_and(|e| e.retryable)
    }

    /// Whether the UI should raise an error banner or toast
    pub fn raises_alert(&self) -> bool {
        self.phase == SectionPhase::Error
    }

    pub fn is_unavailable(&self) -> bool {
        self.empty_reason == Some(EmptyReason::Unavailable)
    }
}

/// Data that can be "successfully empty"
pub trait SectionData {
    fn is_empty(&self) -> bool;
}

impl SectionData for Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

impl<T> SectionData for Vec<T> {
    fn is_empty(&self) -> bool {
        Vec::is_empty(self)
    }
}

/// Everything a section's data type needs
pub trait SectionValue: SectionData + Serialize + Clone + Send + Sync + 'static {}

impl<T> SectionValue for T where T: SectionData + Serialize + Clone + Send + Sync + 'static {}

/// Source of a section's data
#[async_trait]
pub trait SectionLoader<T>: Send + Sync {
    /// Load fresh data; `Ok(None)` means a successful empty answer
    async fn load(&self, cancel: &CancellationToken) -> Result<Option<T>, ClassifiedError>;
}

/// Loads a section from one backend endpoint through the dispatcher
pub struct EndpointLoader<T> {
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn HttpTransport>,
    key: String,
    request: ApiRequest,
    policy: DispatchPolicy,
    _data: PhantomData<fn() -> T>,
}

impl<T> EndpointLoader<T> {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        transport: Arc<dyn HttpTransport>,
        key: impl Into<String>,
        path: impl Into<String>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            dispatcher,
            transport,
            key: key.into(),
            request: ApiRequest::get(path),
            policy,
            _data: PhantomData,
        }
    }
}

#[async_trait]
impl<T> SectionLoader<T> for EndpointLoader<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn load(&self, cancel: &CancellationToken) -> Result<Option<T>, ClassifiedError> {
        self.dispatcher
            .fetch::<T, _, _>(&self.key, &self.policy, cancel, || {
                self.transport.execute(&self.request)
            })
            .await
    }
}

/// Result of a refresh request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Completed(SectionPhase),
    /// A load for this section was already in flight
    Skipped,
}

/// Clears the in-flight flag however the refresh ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn current_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One independently loading dashboard section
pub struct Section<T> {
    name: String,
    loader: Arc<dyn SectionLoader<T>>,
    poll_interval: Option<Duration>,
    state: watch::Sender<SectionState<T>>,
    in_flight: AtomicBool,
}

impl<T> fmt::Debug for Section<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("name", &self.name)
            .field("poll_interval", &self.poll_interval)
            .field("phase", &self.state.borrow().phase)
            .finish()
    }
}

impl<T: SectionValue> Section<T> {
    /// Create a section. Without a poll interval it loads once.
    pub fn new(
        name: impl Into<String>,
        loader: Arc<dyn SectionLoader<T>>,
        poll_interval: Option<Duration>,
    ) -> Self {
        let (state, _) = watch::channel(SectionState::loading());
        Self {
            name: name.into(),
            loader,
            poll_interval,
            state,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SectionState<T> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SectionState<T>> {
        self.state.subscribe()
    }

    /// Load once, unless a load is already running
    pub async fn refresh(&self, cancel: &CancellationToken) -> RefreshOutcome {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Section '{}' already loading, skipping", self.name);
            return RefreshOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.in_flight);

        let previous = self.state();
        self.state.send_modify(|state| {
            state.phase = SectionPhase::Loading;
            state.error = None;
            state.empty_reason = None;
        });

        let loader = Arc::clone(&self.loader);
        let token = cancel.clone();
        let task = tokio::spawn(async move { loader.load(&token).await });
        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Section '{}' loader crashed: {}", self.name, e);
                Err(ClassifiedError::fatal(&self.name, format!("section loader crashed: {}", e)))
            }
        };

        let next = match result {
            Err(e) if e.kind == ErrorKind::Cancelled => {
                debug!("Section '{}' refresh cancelled", self.name);
                previous
            }
            other => Self::settle(&self.name, previous, other),
        };
        let phase = next.phase;
        self.state.send_replace(next);
        RefreshOutcome::Completed(phase)
    }

    fn settle(
        name: &str,
        previous: SectionState<T>,
        result: Result<Option<T>, ClassifiedError>,
    ) -> SectionState<T> {
        let now = Some(current_epoch_ms());
        match result {
            Ok(Some(data)) if !data.is_empty() => SectionState {
                phase: SectionPhase::Success,
                data: Some(data),
                error: None,
                empty_reason: None,
                last_updated_at_epoch_ms: now,
            },
            Ok(_) => SectionState {
                phase: SectionPhase::Empty,
                data: None,
                error: None,
                empty_reason: Some(EmptyReason::NoData),
                last_updated_at_epoch_ms: now,
            },
            Err(e) if e.kind == ErrorKind::Unavailable => {
                info!("Section '{}' not available on this backend", name);
                SectionState {
                    phase: SectionPhase::Empty,
                    data: None,
                    error: None,
                    empty_reason: Some(EmptyReason::Unavailable),
                    last_updated_at_epoch_ms: now,
                }
            }
            Err(e) => {
                warn!("Section '{}' failed: {}", name, e);
                SectionState {
                    phase: SectionPhase::Error,
                    data: previous.data,
                    error: Some(e),
                    empty_reason: None,
                    last_updated_at_epoch_ms: previous.last_updated_at_epoch_ms,
                }
            }
        }
    }

    /// Poll until cancelled or the feature turns out to be unavailable
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(period) = self.poll_interval else {
            self.refresh(&cancel).await;
            return;
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.refresh(&cancel).await;
            if self.state.borrow().is_unavailable() {
                info!("Section '{}' stops polling", self.name);
                break;
            }
        }
        debug!("Section '{}' poll loop stopped", self.name);
    }

    pub fn summary(&self) -> SectionSummary {
        let state = self.state.borrow();
        let data = state.data.as_ref().and_then(|d| match serde_json::to_value(d) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Section '{}' data does not serialize: {}", self.name, e);
                None
            }
        });
        SectionSummary {
            name: self.name.clone(),
            phase: state.phase,
            data,
            error: state.error.clone(),
            empty_reason: state.empty_reason,
            last_updated_at_epoch_ms: state.last_updated_at_epoch_ms,
            retry_available: state.retry_available(),
            raises_alert: state.raises_alert(),
        }
    }
}

/// JSON-ready view of one section
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionSummary {
    pub name: String,
    pub phase: SectionPhase,
    pub data: Option<Value>,
    pub error: Option<ClassifiedError>,
    pub empty_reason: Option<EmptyReason>,
    pub last_updated_at_epoch_ms: Option<u64>,
    pub retry_available: bool,
    pub raises_alert: bool,
}

/// Type-erased section, so sections of different data types live together
#[async_trait]
trait SectionDriver: Send + Sync {
    fn name(&self) -> &str;
    fn summary(&self) -> SectionSummary;
    async fn refresh(&self, cancel: &CancellationToken) -> RefreshOutcome;
    async fn run(&self, cancel: CancellationToken);
}

#[async_trait]
impl<T: SectionValue> SectionDriver for Section<T> {
    fn name(&self) -> &str {
        Section::name(self)
    }

    fn summary(&self) -> SectionSummary {
        Section::summary(self)
    }

    async fn refresh(&self, cancel: &CancellationToken) -> RefreshOutcome {
        Section::refresh(self, cancel).await
    }

    async fn run(&self, cancel: CancellationToken) {
        Section::run(self, cancel).await
    }
}

/// Owns every section of the dashboard
#[derive(Default)]
pub struct SectionComposer {
    sections: Vec<Arc<dyn SectionDriver>>,
}

impl fmt::Debug for SectionComposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sections.iter().map(|s| s.name()))
            .finish()
    }
}

impl SectionComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a section; the returned handle keeps typed access
    pub fn add<T: SectionValue>(&mut self, section: Section<T>) -> Arc<Section<T>> {
        let section = Arc::new(section);
        self.sections.push(section.clone());
        section
    }

    pub fn names(&self) -> Vec<String> {
        self.sections.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn summaries(&self) -> Vec<SectionSummary> {
        self.sections.iter().map(|s| s.summary()).collect()
    }

    pub fn summary(&self, name: &str) -> Option<SectionSummary> {
        self.find(name).map(|s| s.summary())
    }

    /// Refresh one section by name; `None` if there is no such section
    pub async fn refresh(&self, name: &str, cancel: &CancellationToken) -> Option<RefreshOutcome> {
        let section = self.find(name)?;
        Some(section.refresh(cancel).await)
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn SectionDriver>> {
        self.sections.iter().find(|s| s.name() == name)
    }

    /// Drive every section's poll loop until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut loops = JoinSet::new();
        for section in &self.sections {
            let section = Arc::clone(section);
            let cancel = cancel.clone();
            loops.spawn(async move { section.run(cancel).await });
        }
        info!("Polling {} section(s)", self.sections.len());

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!("Section poll loop crashed: {}", e);
            }
        }
    }
}

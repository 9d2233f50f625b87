//! Fleet Sync - resilience and offline-sync layer for a device-fleet dashboard
//!
//! Classifies backend failures, retries them behind per-endpoint circuits,
//! keeps an event stream connected, queues operator actions while offline
//! and composes independently loading dashboard sections.

pub mod backoff;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod dashboard;
pub mod dispatcher;
pub mod error;
pub mod io;
pub mod queue;
pub mod section;
pub mod store;
pub mod stream;

pub use config::{load_config, Config};
pub use error::{ClassifiedError, ErrorKind, FleetSyncError, Result};

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SectionConfig;
use crate::dispatcher::Dispatcher;
use crate::io::{HttpStreamConnector, HttpTransport, ReqwestTransport, StreamConnector};
use crate::queue::ActionQueue;
use crate::section::{EndpointLoader, Section, SectionComposer};
use crate::store::{ActionStore, JsonFileStore, MemoryStore};
use crate::stream::{CloseReason, Reconnector, ReconnectorHandle, StreamEvent, StreamState};

/// Run the fleet sync service with the given configuration
pub async fn run(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(
        &config.backend.base_url,
        config.backend.request_timeout,
    )?);
    let dispatcher = Arc::new(Dispatcher::new(config.circuit.clone()));

    // Build the action queue
    let store: Arc<dyn ActionStore> = match &config.queue.store_dir {
        Some(dir) => Arc::new(JsonFileStore::open(dir).await?),
        None => {
            tracing::warn!(
                "No queue.store_dir configured; queued actions will not survive a restart"
            );
            Arc::new(MemoryStore::new())
        }
    };
    let queue = Arc::new(
        ActionQueue::open(
            store,
            Arc::clone(&dispatcher),
            Arc::clone(&transport),
            config.queue.clone(),
        )
        .await?,
    );

    // Build sections
    let composer = Arc::new(build_composer(&config, &dispatcher, &transport));

    // Connectivity; without a stream the backend is assumed reachable
    let (online_tx, online_rx) = watch::channel(true);

    let stream = match &config.stream {
        Some(stream_config) => {
            let connector = HttpStreamConnector::new(
                &config.backend.base_url,
                &stream_config.path,
                stream_config.connect_timeout,
                stream_config.resume,
            )?;
            let connector = match &stream_config.snapshot_path {
                Some(path) => connector.with_snapshot(Arc::clone(&transport), path),
                None => connector,
            };
            Some(start_stream(
                Arc::new(connector),
                stream_config,
                config.sections.clone(),
                Arc::clone(&composer),
                cancel.clone(),
            ))
        }
        None => None,
    };

    // Setup shutdown handler
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                cancel_for_signal.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    // Start dashboard if enabled
    if config.dashboard.enabled {
        let dashboard_port = config.dashboard.port;
        let dashboard_state = dashboard::DashboardState {
            composer: Arc::clone(&composer),
            queue: Arc::clone(&queue),
            dispatcher: Arc::clone(&dispatcher),
            online: online_rx.clone(),
            stream: stream.as_ref().map(ReconnectorHandle::subscribe),
            cancel: cancel.clone(),
        };
        let cancel_for_dashboard = cancel.clone();

        tokio::spawn(async move {
            let router = dashboard::build_router(dashboard_state);
            let addr = SocketAddr::from(([0, 0, 0, 0], dashboard_port));
            tracing::info!("Status API listening on http://{}", addr);

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(
                        "Failed to bind status API to port {}: {}. Continuing without it.",
                        dashboard_port,
                        e
                    );
                    return;
                }
            };

            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    cancel_for_dashboard.cancelled().await;
                })
                .await
                .ok();

            tracing::debug!("Status API stopped");
        });
    }

    tracing::info!(
        "Fleet sync started ({} section(s), {} queued action(s))",
        composer.names().len(),
        queue.pending_count()
    );

    // Run sections, flush triggers and connectivity (blocks until cancelled)
    tokio::join!(
        composer.run(cancel.clone()),
        queue.run_flush_triggers(dispatcher.circuits().subscribe(), online_rx, cancel.clone()),
        track_connectivity(
            stream.as_ref().map(ReconnectorHandle::subscribe),
            &online_tx,
            &cancel,
        ),
    );

    if let Some(stream) = stream {
        stream.close();
        let state = stream.closed().await;
        tracing::debug!("Event stream ended in state {:?}", state);
    }
    tracing::info!("Fleet sync stopped");

    Ok(())
}

/// One section per configured endpoint, all sharing one dispatcher
pub fn build_composer(
    config: &Config,
    dispatcher: &Arc<Dispatcher>,
    transport: &Arc<dyn HttpTransport>,
) -> SectionComposer {
    let mut composer = SectionComposer::new();
    for section in &config.sections {
        let loader = EndpointLoader::<Value>::new(
            Arc::clone(dispatcher),
            Arc::clone(transport),
            section.endpoint_key(),
            section.path.clone(),
            section.dispatch_policy(&config.retry),
        );
        composer.add(Section::<Value>::new(
            section.name.clone(),
            Arc::new(loader),
            section.poll_interval,
        ));
        tracing::debug!("Added section '{}' ({})", section.name, section.path);
    }
    composer
}

/// Connectivity implied by a stream state; `None` leaves it unchanged
pub fn connectivity(state: StreamState) -> Option<bool> {
    match state {
        StreamState::Open => Some(true),
        StreamState::Backoff { .. } | StreamState::Closed(CloseReason::Exhausted) => Some(false),
        // No stream on this backend says nothing about reachability
        StreamState::Closed(CloseReason::Unavailable) => Some(true),
        StreamState::Idle
        | StreamState::Connecting
        | StreamState::Closed(CloseReason::Caller)
        | StreamState::Closed(CloseReason::Fatal) => None,
    }
}

/// Spawn the reconnector and route its events to section refreshes
fn start_stream(
    connector: Arc<dyn StreamConnector>,
    stream_config: &stream::StreamConfig,
    sections: Vec<SectionConfig>,
    composer: Arc<SectionComposer>,
    cancel: CancellationToken,
) -> ReconnectorHandle {
    let (events_tx, events_rx) = mpsc::channel(64);
    let handle = Reconnector::spawn(connector, stream_config, events_tx);
    tokio::spawn(route_events(events_rx, sections, composer, cancel));
    handle
}

/// Mirror stream state into the connectivity signal until cancelled
///
/// The sender outlives the stream so flush triggers keep running after it
/// closes.
async fn track_connectivity(
    states: Option<watch::Receiver<StreamState>>,
    online: &watch::Sender<bool>,
    cancel: &CancellationToken,
) {
    if let Some(mut states) = states {
        loop {
            if let Some(reachable) = connectivity(*states.borrow_and_update()) {
                online.send_if_modified(|current| {
                    let changed = *current != reachable;
                    *current = reachable;
                    changed
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
    cancel.cancelled().await;
}

/// Refresh every section listening to an event's topic
async fn route_events(
    mut events: mpsc::Receiver<StreamEvent>,
    sections: Vec<SectionConfig>,
    composer: Arc<SectionComposer>,
    cancel: CancellationToken,
) {
    while let Some(event) = events.recv().await {
        let Some(topic) = event.topic.as_deref() else {
            continue;
        };
        for section in sections.iter().filter(|s| s.listens_to(topic)) {
            tracing::debug!("Event '{}' refreshes section '{}'", topic, section.name);
            let composer = Arc::clone(&composer);
            let name = section.name.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                composer.refresh(&name, &cancel).await;
            });
        }
    }
    tracing::debug!("Event routing stopped");
}

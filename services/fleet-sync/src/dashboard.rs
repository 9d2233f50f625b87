//! Status API: section states, the pending/failed actions panel, circuits
//! and stream state as JSON

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::ErrorKind;
use crate::queue::{ActionQueue, NewAction, Resolution, ResolveError, SubmitOutcome};
use crate::section::SectionComposer;
use crate::stream::StreamState;

/// Dashboard application state
#[derive(Clone)]
pub struct DashboardState {
    pub composer: Arc<SectionComposer>,
    pub queue: Arc<ActionQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub online: watch::Receiver<bool>,
    pub stream: Option<watch::Receiver<StreamState>>,
    pub cancel: CancellationToken,
}

/// Build the dashboard axum router
pub fn build_router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/sections", get(sections_handler))
        .route("/api/sections/{name}", get(section_handler))
        .route("/api/sections/{name}/refresh", post(refresh_handler))
        .route("/api/actions", get(actions_handler).post(submit_handler))
        .route("/api/actions/flush", post(flush_handler))
        .route("/api/actions/{id}/resolve", post(resolve_handler))
        .route("/api/circuits", get(circuits_handler))
        .route("/api/stream", get(stream_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn sections_handler(State(dashboard): State<DashboardState>) -> impl IntoResponse {
    Json(dashboard.composer.summaries())
}

async fn section_handler(
    State(dashboard): State<DashboardState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match dashboard.composer.summary(&name) {
        Some(summary) => Json(summary).into_response(),
        None => not_found(format!("No section named '{}'", name)),
    }
}

async fn refresh_handler(
    State(dashboard): State<DashboardState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    tracing::debug!("Refresh requested for section '{}'", name);
    match dashboard.composer.refresh(&name, &dashboard.cancel).await {
        Some(outcome) => Json(serde_json::json!({
            "outcome": outcome,
            "section": dashboard.composer.summary(&name),
        }))
        .into_response(),
        None => not_found(format!("No section named '{}'", name)),
    }
}

async fn actions_handler(State(dashboard): State<DashboardState>) -> impl IntoResponse {
    Json(dashboard.queue.snapshot())
}

async fn submit_handler(
    State(dashboard): State<DashboardState>,
    Json(action): Json<NewAction>,
) -> impl IntoResponse {
    let online = *dashboard.online.borrow();
    match dashboard
        .queue
        .submit(action, online, &dashboard.cancel)
        .await
    {
        Ok(SubmitOutcome::Sent(data)) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "sent", "data": data})),
        )
            .into_response(),
        Ok(SubmitOutcome::Queued(id)) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "queued", "id": id})),
        )
            .into_response(),
        Ok(SubmitOutcome::Rejected(error)) => {
            let status = match error.kind {
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Unavailable => StatusCode::NOT_IMPLEMENTED,
                ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Fatal | ErrorKind::Transient => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(serde_json::json!({"status": "rejected", "error": error})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Failed to queue action: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    message: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn flush_handler(State(dashboard): State<DashboardState>) -> impl IntoResponse {
    Json(dashboard.queue.flush(&dashboard.cancel).await)
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    resolution: Resolution,
}

async fn resolve_handler(
    State(dashboard): State<DashboardState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> impl IntoResponse {
    match dashboard.queue.resolve(id, request.resolution).await {
        Ok(action) => Json(serde_json::json!({"action": action})).into_response(),
        Err(e @ ResolveError::NotFound(_)) => not_found(e.to_string()),
        Err(e @ ResolveError::NotResolvable { .. }) => (
            StatusCode::CONFLICT,
            Json(ErrorBody {
                message: e.to_string(),
            }),
        )
            .into_response(),
        Err(e @ ResolveError::Store(_)) => {
            tracing::error!("Failed to resolve action {}: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    message: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn circuits_handler(State(dashboard): State<DashboardState>) -> impl IntoResponse {
    Json(dashboard.dispatcher.circuits().snapshot())
}

async fn stream_handler(State(dashboard): State<DashboardState>) -> impl IntoResponse {
    let state = dashboard.stream.as_ref().map(|rx| *rx.borrow());
    Json(serde_json::json!({
        "online": *dashboard.online.borrow(),
        "stream": state,
    }))
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

fn not_found(message: String) -> axum::response::Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody { message })).into_response()
}

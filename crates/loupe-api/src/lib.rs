//! HTTP API for loupe: task CRUD for the browser extension and review UI,
//! the completion/progress endpoints the agent side uses, and a live event
//! stream.
//!
//! Built with axum for async HTTP serving.

mod sse;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use loupe_core::error::QueueError;
use loupe_core::event::{ActivityEntry, ActivityKind};
use loupe_core::task::{NewTask, StatusCounts, Task, TaskId, TaskStatus, TaskUpdate};
use loupe_db::artifact_store::{Artifact, ArtifactStore};
use loupe_runner::queue::{ActivityOutcome, CancelOutcome, LocalQueue};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state for API handlers.
pub struct ApiState {
    pub queue: LocalQueue,
    /// Cancelled when the server starts shutting down; ends open event streams.
    closing: CancellationToken,
}

impl ApiState {
    pub fn new(queue: LocalQueue) -> Self {
        Self {
            queue,
            closing: CancellationToken::new(),
        }
    }

    /// Open the queue under `data_dir` with its own event bus.
    pub fn open(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::new(LocalQueue::open(data_dir)?))
    }
}

/// Build the API router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/status", get(status))
        .route("/api/v1/tasks", get(list_tasks).post(create_task))
        .route("/api/v1/tasks/next", get(next_task))
        .route(
            "/api/v1/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/v1/tasks/{id}/screenshot", get(get_screenshot))
        .route(
            "/api/v1/tasks/{id}/after-screenshot",
            get(get_after_screenshot).post(upload_after_screenshot),
        )
        .route(
            "/api/v1/tasks/{id}/activity",
            get(get_activity).post(post_activity),
        )
        .route("/api/v1/tasks/{id}/cancel", post(cancel_task))
        .route("/api/v1/tasks/{id}/retry", post(retry_task))
        .route("/api/v1/events/stream", get(sse::event_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the API server with a graceful shutdown signal.
///
/// When the token is cancelled, the server stops accepting new connections
/// and finishes in-flight requests.
pub async fn serve_with_shutdown(
    state: Arc<ApiState>,
    bind_addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    serve_listener(state, listener, shutdown).await
}

/// Serve on an already-bound listener.
pub async fn serve_listener(
    state: Arc<ApiState>,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let closing = state.closing.clone();
    let app = api_router(state);
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "starting API server");
    // Event streams never finish on their own, so graceful shutdown has to
    // close them before it can complete.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            closing.cancel();
        })
        .await?;
    tracing::info!("API server shut down gracefully");
    Ok(())
}

// ─── Error type ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: anyhow::anyhow!(msg.into()),
        }
    }

    fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            error: anyhow::anyhow!(msg.into()),
        }
    }

    fn task_not_found(id: &TaskId) -> Self {
        Self::not_found(format!("task {id} not found"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(error = %self.error, "request failed");
        }
        let body = serde_json::json!({ "error": self.error.to_string() });
        (self.status, Json(body)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> Self {
        let error = e.into();
        let status = match error.downcast_ref::<QueueError>() {
            Some(QueueError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            Some(queue_error) if queue_error.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, error }
    }
}

// ─── Health & Status ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    counts: StatusCounts,
    /// Live event-stream subscribers, the dispatcher included.
    subscribers: usize,
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        counts: state.queue.status_counts(),
        subscribers: state.queue.bus().subscriber_count(),
    })
}

// ─── Tasks ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let filter: Option<TaskStatus> = query.status.as_deref().map(str::parse).transpose()?;
    let tasks = state
        .queue
        .list()
        .into_iter()
        .filter(|t| filter.is_none_or(|status| t.status == status))
        .collect();
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(input): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let task = state.queue.create(input)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn next_task(State(state): State<Arc<ApiState>>) -> Result<Json<Task>, AppError> {
    state
        .queue
        .next_pending()
        .map(Json)
        .ok_or_else(|| AppError::not_found("no pending tasks"))
}

async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<Task>, AppError> {
    state
        .queue
        .get(&id)
        .map(Json)
        .ok_or_else(|| AppError::task_not_found(&id))
}

/// PATCH body is free-form JSON; only the updatable fields are applied.
async fn update_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<Task>, AppError> {
    let update = TaskUpdate::from_json(body)?;
    state
        .queue
        .update(&id, update)?
        .map(Json)
        .ok_or_else(|| AppError::task_not_found(&id))
}

async fn delete_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
) -> Result<StatusCode, AppError> {
    if state.queue.delete(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::task_not_found(&id))
    }
}

// ─── Screenshots ─────────────────────────────────────────────────────────

async fn get_screenshot(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
) -> Result<Response, AppError> {
    png_response(&state, &id, Artifact::Before)
}

async fn get_after_screenshot(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
) -> Result<Response, AppError> {
    png_response(&state, &id, Artifact::After)
}

fn png_response(state: &ApiState, id: &TaskId, which: Artifact) -> Result<Response, AppError> {
    if state.queue.get(id).is_none() {
        return Err(AppError::task_not_found(id));
    }
    let bytes = state
        .queue
        .store()
        .artifacts()
        .read(id, which)?
        .ok_or_else(|| AppError::not_found(format!("task {id} has no such screenshot")))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], Bytes::from(bytes)).into_response())
}

#[derive(Deserialize)]
struct ScreenshotUpload {
    /// Base64 PNG, plain or as a data URL.
    image: String,
}

async fn upload_after_screenshot(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
    Json(body): Json<ScreenshotUpload>,
) -> Result<Json<Task>, AppError> {
    let bytes = ArtifactStore::decode(&body.image)?;
    state
        .queue
        .save_after_screenshot(&id, &bytes)?
        .map(Json)
        .ok_or_else(|| AppError::task_not_found(&id))
}

// ─── Activity ────────────────────────────────────────────────────────────

async fn get_activity(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<Vec<ActivityEntry>>, AppError> {
    state
        .queue
        .activity(&id)
        .map(Json)
        .ok_or_else(|| AppError::task_not_found(&id))
}

#[derive(Deserialize)]
struct ActivityPost {
    kind: ActivityKind,
    summary: String,
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

async fn post_activity(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
    Json(body): Json<ActivityPost>,
) -> Result<StatusCode, AppError> {
    let mut entry = ActivityEntry::new(body.kind, body.summary);
    if let Some(timestamp) = body.timestamp {
        entry.timestamp = timestamp;
    }
    match state.queue.push_activity(&id, entry) {
        ActivityOutcome::Recorded => Ok(StatusCode::NO_CONTENT),
        ActivityOutcome::NotRunning => Err(AppError::conflict(format!(
            "task {id} is not in progress"
        ))),
        ActivityOutcome::NotFound => Err(AppError::task_not_found(&id)),
    }
}

// ─── Review flow ─────────────────────────────────────────────────────────

async fn cancel_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<Task>, AppError> {
    match state.queue.cancel(&id)? {
        CancelOutcome::Cancelled(task) => Ok(Json(task)),
        CancelOutcome::NotRunning(task) => Err(AppError::conflict(format!(
            "task {id} is '{}', only in-progress tasks can be cancelled",
            task.status
        ))),
        CancelOutcome::NotFound => Err(AppError::task_not_found(&id)),
    }
}

#[derive(Deserialize)]
struct RetryRequest {
    #[serde(default)]
    reason: String,
}

async fn retry_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
    Json(body): Json<RetryRequest>,
) -> Result<Json<Task>, AppError> {
    let reason = body.reason.trim();
    let reason = if reason.is_empty() {
        "rejected without a reason"
    } else {
        reason
    };
    state
        .queue
        .retry(&id, reason)?
        .map(Json)
        .ok_or_else(|| AppError::task_not_found(&id))
}

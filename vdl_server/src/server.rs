use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use vdl_core::{DownloadError, DownloadRequest, Orchestrator, StatusBlock, ANONYMOUS_USER};

use crate::cookies::{cookie_value, user_cookie};
use crate::delivery::deliver_file;
use crate::events::event_stream;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(Self { orchestrator })
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Boundary error: an HTTP status plus a `{"detail": …}` body.
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = match &err {
            DownloadError::UnsupportedUrl => StatusCode::BAD_REQUEST,
            DownloadError::LockConflict => StatusCode::CONFLICT,
            DownloadError::TaskNotFound(_) | DownloadError::FileMissing(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            log::error!("[api] {}: {}", self.status, self.detail);
        }
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/api/get-formats", post(get_formats_handler))
        .route("/api/start-download", post(start_download_handler))
        .route("/api/download-status/{task_id}", get(status_handler))
        .route("/api/download-events/{task_id}", get(events_handler))
        .route("/api/cancel/{task_id}", post(cancel_handler))
        .route("/api/get-video/{task_id}", get(get_video_handler))
        .route("/user/{user_id}/history", get(history_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct FormatsRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct UserHistory {
    history: Vec<StatusBlock>,
}

/// A path segment that must look like a task id.
fn checked_task_id(raw: &str) -> Result<&str, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid task_id"))?;
    Ok(raw)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/get-formats — resolve the media snapshot for a URL.
async fn get_formats_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FormatsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    log::info!("[formats] url=\"{}\"", request.url);
    let media = state.orchestrator.resolve_formats(&request.url).await?;
    if media.variants.is_empty() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "No formats"));
    }
    Ok(Json(media))
}

/// POST /api/start-download — admit a task and enqueue it.
/// Issues a `user_id` cookie when the client has none.
async fn start_download_handler(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let (user_id, issued) = match cookie_value(&headers, "user_id") {
        Some(user_id) => (user_id, false),
        None => (Uuid::new_v4().to_string(), true),
    };
    log::info!(
        "[download] user={user_id} url=\"{}\" video={} audio={}",
        request.url,
        request.video_variant_id,
        request.audio_variant_id,
    );

    let status = state.orchestrator.start_download(&user_id, request).await?;

    let mut response = Json(status).into_response();
    if issued {
        if let Ok(value) = HeaderValue::from_str(&user_cookie(&user_id)) {
            response.headers_mut().insert(SET_COOKIE, value);
        }
    }
    Ok(response)
}

/// GET /api/download-status/{task_id}
async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<StatusBlock>, ApiError> {
    let task_id = checked_task_id(&task_id)?;
    match state.orchestrator.get_status(task_id).await? {
        Some(status) => Ok(Json(status)),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Task with id {task_id} not found."),
        )),
    }
}

/// GET /api/download-events/{task_id} — SSE tail of status snapshots.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = checked_task_id(&task_id)?.to_string();
    event_stream(state, task_id).await
}

/// POST /api/cancel/{task_id}
async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task_id = checked_task_id(&task_id)?;
    state.orchestrator.cancel_download(task_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// GET /api/get-video/{task_id} — stream the produced file.
async fn get_video_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let task_id = checked_task_id(&task_id)?.to_string();
    deliver_file(state, task_id).await
}

/// GET /user/{user_id}/history — most recent status blocks, newest first.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserHistory>, ApiError> {
    if user_id != ANONYMOUS_USER && Uuid::parse_str(&user_id).is_err() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "User not found"));
    }
    let history = state.orchestrator.user_history(&user_id).await?;
    Ok(Json(UserHistory { history }))
}

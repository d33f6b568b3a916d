//! JSON HTTP API over a [`Harness`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/files?filename=` | Upload raw bytes |
//! | `POST`   | `/notes` | Store a text artifact (`{title, text}`) |
//! | `GET`    | `/files/{id}/status` | Status, retry count, last error |
//! | `POST`   | `/files/{id}/retry` | Retry a file in `error` |
//! | `POST`   | `/files/{id}/reanalyze` | Drop AI metadata and classify again |
//! | `DELETE` | `/files/{id}` | Delete a file everywhere |
//! | `POST`   | `/files/{id}/tags` | Add a manual tag (`{tag}`) |
//! | `DELETE` | `/files/{id}/tags/{tag}` | Remove a manual tag |
//! | `POST`   | `/search` | Hybrid search |
//! | `POST`   | `/admin/reindex` | Rebuild all vectors |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `timeout` (408), `vectors_disabled` (400), `internal` (500).

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::harness::Harness;
use crate::ingest::AddOutcome;
use crate::jobs::ReindexReport;
use crate::models::FileStatusView;
use crate::search::{SearchCancelled, SearchOptions, SearchResponse};

/// Upper bound on one search request before it is abandoned.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    harness: Arc<Harness>,
}

pub fn router(harness: Arc<Harness>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/files", post(handle_upload))
        .route("/notes", post(handle_note))
        .route("/files/{id}", delete(handle_delete))
        .route("/files/{id}/status", get(handle_status))
        .route("/files/{id}/retry", post(handle_retry))
        .route("/files/{id}/reanalyze", post(handle_reanalyze))
        .route("/files/{id}/tags", post(handle_add_tag))
        .route("/files/{id}/tags/{tag}", delete(handle_remove_tag))
        .route("/search", post(handle_search))
        .route("/admin/reindex", post(handle_reindex))
        .layer(cors)
        .with_state(AppState { harness })
}

/// Serve until Ctrl-C, then drain the ingestion queue.
pub async fn run_server(harness: Arc<Harness>) -> anyhow::Result<()> {
    let bind_addr = harness.config().server.bind.clone();
    let app = router(harness.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    harness.shutdown().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %err, "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(id: &str) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: format!("file not found: {}", id),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict",
        message: message.into(),
    }
}

fn vectors_disabled() -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "vectors_disabled",
        message: "vector index unavailable: embeddings disabled or index unreachable".to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    semantic: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        semantic: state.harness.semantic_available(),
    })
}

// ============ Uploads ============

#[derive(Deserialize)]
struct UploadParams {
    filename: String,
}

async fn handle_upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<AddOutcome>), AppError> {
    if body.is_empty() {
        return Err(bad_request("upload body must not be empty"));
    }
    let outcome = state.harness.add_file(&params.filename, &body).await?;
    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

#[derive(Deserialize)]
struct NoteRequest {
    #[serde(default)]
    title: String,
    text: String,
}

async fn handle_note(
    State(state): State<AppState>,
    Json(req): Json<NoteRequest>,
) -> Result<(StatusCode, Json<AddOutcome>), AppError> {
    if req.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let outcome = state.harness.add_text(&req.title, &req.text).await?;
    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

// ============ Lifecycle ============

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FileStatusView>, AppError> {
    match state.harness.status(&id).await? {
        Some(view) => Ok(Json(view)),
        None => Err(not_found(&id)),
    }
}

async fn handle_retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FileStatusView>, AppError> {
    let Some(current) = state.harness.status(&id).await? else {
        return Err(not_found(&id));
    };
    if !state.harness.retry(&id).await? {
        return Err(conflict(format!(
            "only files in error can be retried (status: {})",
            current.status
        )));
    }
    current_status(&state, &id).await
}

async fn handle_reanalyze(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FileStatusView>, AppError> {
    if !state.harness.reanalyze(&id).await? {
        return Err(not_found(&id));
    }
    current_status(&state, &id).await
}

async fn current_status(state: &AppState, id: &str) -> Result<Json<FileStatusView>, AppError> {
    state
        .harness
        .status(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    if !state.harness.delete(&id).await? {
        return Err(not_found(&id));
    }
    Ok(Json(DeleteResponse { deleted: true }))
}

// ============ Tags ============

#[derive(Deserialize)]
struct TagRequest {
    tag: String,
}

#[derive(Serialize)]
struct TagResponse {
    file_id: String,
    tag: String,
}

async fn handle_add_tag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TagRequest>,
) -> Result<(StatusCode, Json<TagResponse>), AppError> {
    if req.tag.trim().is_empty() {
        return Err(bad_request("tag must not be empty"));
    }
    if !state.harness.add_tag(&id, &req.tag).await? {
        return Err(not_found(&id));
    }
    Ok((
        StatusCode::CREATED,
        Json(TagResponse {
            file_id: id,
            tag: req.tag.trim().to_lowercase(),
        }),
    ))
}

async fn handle_remove_tag(
    State(state): State<AppState>,
    Path((id, tag)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    if !state.harness.remove_tag(&id, &tag).await? {
        return Err(AppError {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: format!("manual tag '{}' not found on {}", tag, id),
        });
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(flatten)]
    options: SearchOptions,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if req.options.top_n == Some(0) {
        return Err(bad_request("top_n must be >= 1"));
    }

    let deadline = tokio::time::sleep(SEARCH_TIMEOUT);
    state
        .harness
        .search_until(&req.query, &req.options, deadline)
        .await
        .map(Json)
        .map_err(search_error)
}

fn search_error(err: anyhow::Error) -> AppError {
    if err.downcast_ref::<SearchCancelled>().is_some() {
        return AppError {
            status: StatusCode::REQUEST_TIMEOUT,
            code: "timeout",
            message: format!("search timed out after {}s", SEARCH_TIMEOUT.as_secs()),
        };
    }
    err.into()
}

// ============ POST /admin/reindex ============

async fn handle_reindex(State(state): State<AppState>) -> Result<Json<ReindexReport>, AppError> {
    if !state.harness.semantic_available() {
        return Err(vectors_disabled());
    }
    Ok(Json(state.harness.reindex().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_search_cancellation_maps_to_timeout() {
        let cancelled = search_error(SearchCancelled.into());
        assert_eq!(cancelled.status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(cancelled.code, "timeout");

        let other = search_error(anyhow::anyhow!("operation cancelled by remote peer"));
        assert_eq!(other.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(other.code, "internal");
    }
}

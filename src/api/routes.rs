//! API route definitions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::model::{BatchSubmission, RunRequest};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(submit_run))
        .route("/runs/{id}", get(run_status))
        .route("/runs/{id}/steps", get(run_steps))
        .route("/batches", post(submit_batch))
        .route("/batches/{id}", get(batch_status))
        .route("/batches/{id}/details", get(batch_details))
        .route("/queue", get(queue_status))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn parse_run_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid run id '{raw}'")))
}

async fn submit_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.base_url.trim().is_empty() {
        return Err(ApiError::BadRequest("base_url is required".to_string()));
    }
    let run_id = state.orchestrator.submit_run(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "run_id": run_id, "status": "queued" } })),
    ))
}

async fn run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run_id = parse_run_id(&id)?;
    let view = state
        .orchestrator
        .run_status(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run {run_id}")))?;
    let active = state.orchestrator.is_running(run_id).await;
    Ok(Json(json!({
        "data": view,
        "meta": { "queue_active": active }
    })))
}

async fn run_steps(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run_id = parse_run_id(&id)?;
    let steps = state
        .orchestrator
        .run_steps(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run {run_id}")))?;
    let total = steps.len();
    Ok(Json(json!({ "data": steps, "meta": { "total": total } })))
}

async fn submit_batch(
    State(state): State<AppState>,
    Json(submission): Json<BatchSubmission>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if submission.base_url.trim().is_empty() {
        return Err(ApiError::BadRequest("base_url is required".to_string()));
    }
    let handle = state.orchestrator.submit_batch(submission).await?;
    let total = handle.run_ids.len();
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": handle, "meta": { "total": total } })),
    ))
}

async fn batch_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let view = state
        .orchestrator
        .batch_status(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("batch {id}")))?;
    Ok(Json(json!({ "data": view })))
}

async fn batch_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let view = state
        .orchestrator
        .batch_details(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("batch {id}")))?;
    Ok(Json(json!({ "data": view })))
}

async fn queue_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.orchestrator.queue_status().await;
    let pending = status.pending.len();
    Json(json!({ "data": status, "meta": { "pending": pending } }))
}

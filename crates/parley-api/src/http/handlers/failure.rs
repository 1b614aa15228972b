//! Failure listing and retry handlers.
//!
//! Retry endpoints only claim and queue; the outcome lands later on the
//! retried records' history and on the new task.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use parley_core::repository::{FailureFilter, FailureStore};
use parley_core::retry::{RetryManyReport, RetryReceipt, TaskRetryReport};
use parley_types::error::PipelineError;
use parley_types::failure::FailedMessage;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Query parameters for the failure list endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct FailedListQuery {
    pub retried: Option<bool>,
    pub task_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RetryRequest {
    /// Must match the record's task when given.
    pub task_id: Option<Uuid>,
    pub context: serde_json::Value,
    pub retry_whole_batch: bool,
}

#[derive(Debug, Deserialize)]
pub struct RetryManyRequest {
    pub failed_message_ids: Vec<Uuid>,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RetryScopeRequest {
    pub context: serde_json::Value,
}

/// GET /api/v1/failed - List failure records, newest first.
pub async fn list_failed(
    State(state): State<AppState>,
    Query(query): Query<FailedListQuery>,
) -> Result<Json<ApiResponse<Vec<FailedMessage>>>, AppError> {
    let timer = RequestTimer::start();

    if query.limit <= 0 {
        return Err(AppError::Validation("limit must be positive".to_string()));
    }
    let failed = state
        .failures
        .list_failed(&FailureFilter {
            retried: query.retried,
            task_id: query.task_id,
            limit: Some(query.limit),
        })
        .await?;

    Ok(Json(timer.respond(failed).with_link("self", "/api/v1/failed")))
}

/// GET /api/v1/failed/:id
pub async fn get_failed(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<FailedMessage>>, AppError> {
    let timer = RequestTimer::start();
    let failed = state
        .failures
        .get_failed(&id)
        .await?
        .ok_or_else(|| PipelineError::not_found("failed message", id))?;
    Ok(Json(timer.respond(failed)))
}

/// POST /api/v1/failed/:id/retry - Claim one record and queue its retry.
pub async fn retry_failed(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RetryRequest>,
) -> Result<Json<ApiResponse<RetryReceipt>>, AppError> {
    let timer = RequestTimer::start();
    let receipt = state
        .retries
        .retry(id, body.task_id, body.context, body.retry_whole_batch)
        .await?;
    Ok(Json(
        timer
            .respond(receipt)
            .with_link("failed", &format!("/api/v1/failed/{id}")),
    ))
}

/// POST /api/v1/failed/retry - Retry several records independently.
pub async fn retry_many(
    State(state): State<AppState>,
    Json(body): Json<RetryManyRequest>,
) -> Result<Json<ApiResponse<RetryManyReport>>, AppError> {
    let timer = RequestTimer::start();
    if body.failed_message_ids.is_empty() {
        return Err(AppError::Validation(
            "failed_message_ids must not be empty".to_string(),
        ));
    }
    let report = state
        .retries
        .retry_many(&body.failed_message_ids, body.context)
        .await;
    Ok(Json(timer.respond(report)))
}

/// POST /api/v1/tasks/:id/retry - Retry every unretried failure of a task.
pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RetryScopeRequest>,
) -> Result<Json<ApiResponse<TaskRetryReport>>, AppError> {
    let timer = RequestTimer::start();
    let report = state.retries.retry_by_task_id(id, body.context).await?;
    Ok(Json(timer.respond(report)))
}

/// POST /api/v1/batches/:batch_id/retry - Same, addressed by batch id.
pub async fn retry_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Json(body): Json<RetryScopeRequest>,
) -> Result<Json<ApiResponse<TaskRetryReport>>, AppError> {
    let timer = RequestTimer::start();
    let report = state
        .retries
        .retry_by_request_task_id(&batch_id, body.context)
        .await?;
    Ok(Json(timer.respond(report)))
}

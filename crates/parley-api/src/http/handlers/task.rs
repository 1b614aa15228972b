//! Task lookup handlers.

use axum::Json;
use axum::extract::{Path, State};
use uuid::Uuid;

use parley_core::repository::BatchStore;
use parley_types::error::PipelineError;
use parley_types::task::Task;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

fn task_response(timer: RequestTimer, task: Task) -> ApiResponse<Task> {
    let this = format!("/api/v1/tasks/{}", task.id);
    let messages = format!("/api/v1/conversations/{}/messages", task.conversation_id);
    let failed = format!("/api/v1/failed?task_id={}", task.id);
    timer
        .respond(task)
        .with_link("self", &this)
        .with_link("messages", &messages)
        .with_link("failed", &failed)
}

/// GET /api/v1/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Task>>, AppError> {
    let timer = RequestTimer::start();
    let task = state
        .batches
        .get_task(&id)
        .await?
        .ok_or_else(|| PipelineError::not_found("task", id))?;
    Ok(Json(task_response(timer, task)))
}

/// GET /api/v1/tasks/by-batch/:batch_id
pub async fn get_task_by_batch_id(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<ApiResponse<Task>>, AppError> {
    let timer = RequestTimer::start();
    let task = state
        .batches
        .get_task_by_batch_id(&batch_id)
        .await?
        .ok_or_else(|| PipelineError::not_found("task", &batch_id))?;
    Ok(Json(task_response(timer, task)))
}

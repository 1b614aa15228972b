//! Message intake and conversation handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use parley_core::batch::OpenBatch;
use parley_core::repository::BatchStore;
use parley_types::error::PipelineError;
use parley_types::message::Message;
use parley_types::task::Task;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    /// Target conversation; the current one (or a new one) when omitted.
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FlushQuery {
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
pub struct MessageListQuery {
    pub limit: Option<i64>,
}

/// POST /api/v1/messages - Buffer a user message into its conversation's batch.
pub async fn post_message(
    State(state): State<AppState>,
    Json(body): Json<PostMessageRequest>,
) -> Result<Json<ApiResponse<Message>>, AppError> {
    let timer = RequestTimer::start();

    let message = state
        .aggregator
        .add_message(&body.content, body.conversation_id)
        .await?;

    let conversation_link = format!("/api/v1/conversations/{}/messages", message.conversation_id);
    let task_link = message.task_id.map(|id| format!("/api/v1/tasks/{id}"));

    let mut resp = timer
        .respond(message)
        .with_link("conversation", &conversation_link);
    if let Some(task_link) = task_link {
        resp = resp.with_link("task", &task_link);
    }
    Ok(Json(resp))
}

/// POST /api/v1/flush - Close the open batch of a conversation now.
///
/// Responds with the dispatched task, or `null` when nothing was open.
pub async fn flush(
    State(state): State<AppState>,
    Query(query): Query<FlushQuery>,
) -> Result<Json<ApiResponse<Option<Task>>>, AppError> {
    let timer = RequestTimer::start();
    let task = state.aggregator.force_process(query.conversation_id).await?;
    Ok(Json(timer.respond(task)))
}

/// GET /api/v1/batches/open - Batches still collecting messages.
pub async fn open_batches(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<OpenBatch>>>, AppError> {
    let timer = RequestTimer::start();
    let open = state.aggregator.open_batches().await;
    Ok(Json(timer.respond(open)))
}

/// POST /api/v1/conversations/:id/archive - Flush, then archive a conversation.
pub async fn archive_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let timer = RequestTimer::start();
    let flushed = state.aggregator.archive_conversation(id).await?;
    Ok(Json(timer.respond(serde_json::json!({
        "conversation_id": id,
        "archived": true,
        "flushed_task_id": flushed.map(|t| t.id),
    }))))
}

/// GET /api/v1/conversations/:id/messages - Conversation history, oldest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<MessageListQuery>,
) -> Result<Json<ApiResponse<Vec<Message>>>, AppError> {
    let timer = RequestTimer::start();

    if state.batches.get_conversation(&id).await?.is_none() {
        return Err(PipelineError::not_found("conversation", id).into());
    }
    let messages = state.batches.list_messages(&id, query.limit).await?;

    Ok(Json(
        timer
            .respond(messages)
            .with_link("self", &format!("/api/v1/conversations/{id}/messages")),
    ))
}

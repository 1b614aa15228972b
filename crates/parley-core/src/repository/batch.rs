//! BatchStore trait definition.
//!
//! Persistence for conversations, messages and batch tasks, plus the two
//! outcome operations that reduce a finished batch in a single transaction.

use chrono::{DateTime, Utc};
use parley_types::conversation::{Conversation, ConversationStatus};
use parley_types::error::RepositoryError;
use parley_types::failure::FailedMessage;
use parley_types::message::Message;
use parley_types::task::{Task, TaskStatus};
use parley_types::work::RetryLink;
use uuid::Uuid;

/// Everything written when a batch's remote call succeeds.
#[derive(Debug, Clone)]
pub struct BatchSuccess {
    pub task_id: Uuid,
    pub conversation_id: Uuid,
    pub member_ids: Vec<Uuid>,
    pub response: String,
    /// Assistant reply, persisted with status `received`.
    pub reply: Message,
    /// Remote conversation id learned from this exchange, if any.
    pub remote_conversation_id: Option<String>,
    pub completed_at: DateTime<Utc>,
    /// The claimed failure records this batch retries, if any.
    pub retry: Option<RetryLink>,
}

/// Everything written when a batch's remote call fails or is abandoned.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub task_id: Uuid,
    /// `failed` or `timeout`.
    pub status: TaskStatus,
    pub error: String,
    pub member_ids: Vec<Uuid>,
    /// One new failure record per member.
    pub failures: Vec<FailedMessage>,
    pub failed_at: DateTime<Utc>,
    pub retry: Option<RetryLink>,
}

/// Repository trait for conversation, message and task persistence.
///
/// Both outcome operations also close every unretried failure record of the
/// member messages: each gets one retry-history entry and `retried = true`,
/// in the same transaction as the outcome itself.
///
/// Both fail with `RepositoryError::Conflict`, writing nothing, when the task
/// is no longer `processing` or when a record named by `retry` is no longer
/// claimed with its token.
pub trait BatchStore: Send + Sync + 'static {
    /// Insert a new conversation.
    fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_conversation(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Conversation>, RepositoryError>> + Send;

    /// Bump the conversation's last-active timestamp.
    fn touch_conversation(
        &self,
        id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn set_conversation_status(
        &self,
        id: &Uuid,
        status: ConversationStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Insert a new message.
    fn save_message(
        &self,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_message(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Message>, RepositoryError>> + Send;

    /// Fetch messages by id, returned in the order of `ids`. Unknown ids are skipped.
    fn get_messages(
        &self,
        ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<Vec<Message>, RepositoryError>> + Send;

    /// Messages of a conversation, ordered by created_at ASC.
    fn list_messages(
        &self,
        conversation_id: &Uuid,
        limit: Option<i64>,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, RepositoryError>> + Send;

    /// Insert a new task with its current member list.
    fn create_task(
        &self,
        task: &Task,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    fn get_task_by_batch_id(
        &self,
        batch_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// Persist a new member: the task's member list, count and aggregated
    /// content, and the message's task back-reference, atomically.
    fn attach_message(
        &self,
        task: &Task,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Freeze the task (dispatched_at) and flag its members `aggregated`.
    fn mark_dispatched(
        &self,
        task_id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move a `pending` task to `processing`. Returns false when the task was
    /// not pending (already picked up or finished).
    fn mark_processing(
        &self,
        task_id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn list_tasks_by_status(
        &self,
        status: TaskStatus,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    fn count_tasks_by_status(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<(TaskStatus, u64)>, RepositoryError>> + Send;

    /// Members `sent`, reply saved, conversation remote id learned, task
    /// `completed`. All-or-nothing.
    fn record_batch_success(
        &self,
        outcome: &BatchSuccess,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Members `failed` with retry count bumped, failure records inserted,
    /// task terminal with the error. All-or-nothing.
    fn record_batch_failure(
        &self,
        outcome: &BatchFailure,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fail a `processing` task without touching its members or any failure
    /// record. No-op when the task already reached a terminal status.
    fn abandon_task(
        &self,
        task_id: &Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

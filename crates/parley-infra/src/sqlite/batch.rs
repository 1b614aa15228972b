//! SQLite batch repository: conversations, messages and tasks.
//!
//! Outcome writes (`record_batch_success` / `record_batch_failure`) run in a
//! single writer transaction covering the task row, every member message, the
//! assistant reply or new failure records, and closure of any open failure
//! records of the members.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parley_core::repository::{BatchFailure, BatchStore, BatchSuccess};
use parley_types::conversation::{Conversation, ConversationStatus};
use parley_types::error::RepositoryError;
use parley_types::failure::{FailedMessage, RetryHistoryEntry, RetryOutcome};
use parley_types::message::{Message, MessageRole, MessageStatus};
use parley_types::task::{Task, TaskStatus};
use parley_types::work::RetryLink;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, query_err, to_json};

/// SQLite-backed implementation of `BatchStore`.
pub struct SqliteBatchRepository {
    pool: DatabasePool,
}

impl SqliteBatchRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct ConversationRow {
    id: String,
    remote_id: Option<String>,
    status: String,
    created_at: String,
    last_active_at: String,
}

impl ConversationRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            remote_id: row.try_get("remote_id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            last_active_at: row.try_get("last_active_at")?,
        })
    }

    fn into_conversation(self) -> Result<Conversation, RepositoryError> {
        let status: ConversationStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(Conversation {
            id: parse_uuid(&self.id, "conversation id")?,
            remote_id: self.remote_id,
            status,
            created_at: parse_datetime(&self.created_at)?,
            last_active_at: parse_datetime(&self.last_active_at)?,
        })
    }
}

struct MessageRow {
    id: String,
    conversation_id: String,
    task_id: Option<String>,
    role: String,
    content: String,
    status: String,
    retry_count: i64,
    error: Option<String>,
    metadata: String,
    created_at: String,
    sent_at: Option<String>,
}

impl MessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            task_id: row.try_get("task_id")?,
            role: row.try_get("role")?,
            content: row.try_get("content")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            error: row.try_get("error")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
        })
    }

    fn into_message(self) -> Result<Message, RepositoryError> {
        let role: MessageRole = self.role.parse().map_err(RepositoryError::Query)?;
        let status: MessageStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(Message {
            id: parse_uuid(&self.id, "message id")?,
            conversation_id: parse_uuid(&self.conversation_id, "conversation_id")?,
            task_id: self
                .task_id
                .as_deref()
                .map(|s| parse_uuid(s, "task_id"))
                .transpose()?,
            role,
            content: self.content,
            status,
            retry_count: self.retry_count as u32,
            error: self.error,
            metadata: parse_json(&self.metadata, "message metadata")?,
            created_at: parse_datetime(&self.created_at)?,
            sent_at: self.sent_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct TaskRow {
    id: String,
    batch_id: String,
    conversation_id: String,
    status: String,
    message_ids: String,
    aggregated_content: String,
    message_count: i64,
    metadata: String,
    response: Option<String>,
    error: Option<String>,
    created_at: String,
    dispatched_at: Option<String>,
    processed_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            conversation_id: row.try_get("conversation_id")?,
            status: row.try_get("status")?,
            message_ids: row.try_get("message_ids")?,
            aggregated_content: row.try_get("aggregated_content")?,
            message_count: row.try_get("message_count")?,
            metadata: row.try_get("metadata")?,
            response: row.try_get("response")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            dispatched_at: row.try_get("dispatched_at")?,
            processed_at: row.try_get("processed_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_task(self) -> Result<Task, RepositoryError> {
        let status: TaskStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let optional = |v: Option<String>| v.as_deref().map(parse_datetime).transpose();
        Ok(Task {
            id: parse_uuid(&self.id, "task id")?,
            batch_id: self.batch_id,
            conversation_id: parse_uuid(&self.conversation_id, "conversation_id")?,
            status,
            message_ids: parse_json(&self.message_ids, "message_ids")?,
            aggregated_content: self.aggregated_content,
            message_count: self.message_count as u32,
            metadata: parse_json(&self.metadata, "task metadata")?,
            response: self.response,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            dispatched_at: optional(self.dispatched_at)?,
            processed_at: optional(self.processed_at)?,
            completed_at: optional(self.completed_at)?,
        })
    }
}

fn rows_to_tasks(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Task>, RepositoryError> {
    rows.iter()
        .map(|row| TaskRow::from_row(row).map_err(query_err)?.into_task())
        .collect()
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

async fn insert_message(
    tx: &mut Transaction<'_, Sqlite>,
    message: &Message,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO messages (id, conversation_id, task_id, role, content, status, retry_count, error, metadata, created_at, sent_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(message.id.to_string())
    .bind(message.conversation_id.to_string())
    .bind(message.task_id.map(|id| id.to_string()))
    .bind(message.role.to_string())
    .bind(&message.content)
    .bind(message.status.to_string())
    .bind(message.retry_count as i64)
    .bind(&message.error)
    .bind(to_json(&message.metadata)?)
    .bind(format_datetime(&message.created_at))
    .bind(message.sent_at.as_ref().map(format_datetime))
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;
    Ok(())
}

/// Close the open failure records of the given messages with one history entry.
///
/// Records claimed by `retry` must still be held by its token, or the whole
/// write fails with `Conflict`. Other records are closed unless a different
/// live claim holds them.
async fn close_failures(
    tx: &mut Transaction<'_, Sqlite>,
    member_ids: &[Uuid],
    entry: &RetryHistoryEntry,
    retry: Option<&RetryLink>,
    now: &DateTime<Utc>,
) -> Result<(), RepositoryError> {
    let entry = to_json(entry)?;
    let token = retry.map(|link| link.claim_token.to_string());

    if let Some(link) = retry {
        for id in &link.failed_message_ids {
            let result = sqlx::query(
                r#"UPDATE failed_messages
                   SET retried = 1,
                       claim_token = NULL,
                       claim_expires_at = NULL,
                       retry_history = json_insert(retry_history, '$[#]', json(?))
                   WHERE id = ? AND retried = 0 AND claim_token = ?"#,
            )
            .bind(&entry)
            .bind(id.to_string())
            .bind(&token)
            .execute(&mut **tx)
            .await
            .map_err(query_err)?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::Conflict(format!(
                    "retry claim on failed message {id} was lost"
                )));
            }
        }
    }

    let now = format_datetime(now);
    for id in member_ids {
        sqlx::query(
            r#"UPDATE failed_messages
               SET retried = 1,
                   claim_token = NULL,
                   claim_expires_at = NULL,
                   retry_history = json_insert(retry_history, '$[#]', json(?))
               WHERE message_id = ? AND retried = 0
                 AND (claim_token IS NULL OR claim_token = ? OR claim_expires_at <= ?)"#,
        )
        .bind(&entry)
        .bind(id.to_string())
        .bind(&token)
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(query_err)?;
    }
    Ok(())
}

fn retry_context(retry: Option<&RetryLink>) -> serde_json::Value {
    retry.map(|link| link.context.clone()).unwrap_or_default()
}

async fn insert_failure(
    tx: &mut Transaction<'_, Sqlite>,
    failure: &FailedMessage,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO failed_messages (id, message_id, task_id, error, attempts, failed_at, context, retried, correlation_id, retry_history, claim_token, claim_expires_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(failure.id.to_string())
    .bind(failure.message_id.to_string())
    .bind(failure.task_id.map(|id| id.to_string()))
    .bind(&failure.error)
    .bind(failure.attempts as i64)
    .bind(format_datetime(&failure.failed_at))
    .bind(to_json(&failure.context)?)
    .bind(failure.retried as i64)
    .bind(&failure.correlation_id)
    .bind(to_json(&failure.retry_history)?)
    .bind(failure.claim.map(|c| c.token.to_string()))
    .bind(failure.claim.map(|c| format_datetime(&c.expires_at)))
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;
    Ok(())
}

/// Settle a `processing` task. Any other status means another writer got
/// there first, reported as `Conflict`.
async fn finish_task(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: &Uuid,
    status: TaskStatus,
    response: Option<&str>,
    error: Option<&str>,
    at: &DateTime<Utc>,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        r#"UPDATE tasks SET status = ?, response = ?, error = ?, completed_at = ?
           WHERE id = ? AND status = 'processing'"#,
    )
    .bind(status.to_string())
    .bind(response)
    .bind(error)
    .bind(format_datetime(at))
    .bind(task_id.to_string())
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;

    if result.rows_affected() == 1 {
        return Ok(());
    }
    let current: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
        .bind(task_id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(query_err)?;
    match current {
        Some(current) => Err(RepositoryError::Conflict(format!(
            "task {task_id} is {current}, not processing"
        ))),
        None => Err(RepositoryError::NotFound),
    }
}

// ---------------------------------------------------------------------------
// BatchStore implementation
// ---------------------------------------------------------------------------

impl BatchStore for SqliteBatchRepository {
    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO conversations (id, remote_id, status, created_at, last_active_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(conversation.id.to_string())
        .bind(&conversation.remote_id)
        .bind(conversation.status.to_string())
        .bind(format_datetime(&conversation.created_at))
        .bind(format_datetime(&conversation.last_active_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_conversation(&self, id: &Uuid) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| {
            ConversationRow::from_row(&row)
                .map_err(query_err)?
                .into_conversation()
        })
        .transpose()
    }

    async fn touch_conversation(
        &self,
        id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE conversations SET last_active_at = ? WHERE id = ?")
            .bind(format_datetime(&at))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_conversation_status(
        &self,
        id: &Uuid,
        status: ConversationStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE conversations SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn save_message(&self, message: &Message) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        insert_message(&mut tx, message).await?;
        tx.commit().await.map_err(query_err)
    }

    async fn get_message(&self, id: &Uuid) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| MessageRow::from_row(&row).map_err(query_err)?.into_message())
            .transpose()
    }

    async fn get_messages(&self, ids: &[Uuid]) -> Result<Vec<Message>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT * FROM messages WHERE id IN (SELECT value FROM json_each(?))")
            .bind(to_json(ids)?)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            let message = MessageRow::from_row(row).map_err(query_err)?.into_message()?;
            by_id.insert(message.id, message);
        }
        // Preserve the caller's order; missing ids are skipped.
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn list_messages(
        &self,
        conversation_id: &Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let mut sql = String::from(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = sqlx::query(&sql)
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| MessageRow::from_row(row).map_err(query_err)?.into_message())
            .collect()
    }

    async fn create_task(&self, task: &Task) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO tasks (id, batch_id, conversation_id, status, message_ids, aggregated_content, message_count, metadata, response, error, created_at, dispatched_at, processed_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(&task.batch_id)
        .bind(task.conversation_id.to_string())
        .bind(task.status.to_string())
        .bind(to_json(&task.message_ids)?)
        .bind(&task.aggregated_content)
        .bind(task.message_count as i64)
        .bind(to_json(&task.metadata)?)
        .bind(&task.response)
        .bind(&task.error)
        .bind(format_datetime(&task.created_at))
        .bind(task.dispatched_at.as_ref().map(format_datetime))
        .bind(task.processed_at.as_ref().map(format_datetime))
        .bind(task.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("task {} already exists", task.batch_id))
            }
            _ => query_err(e),
        })?;
        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| TaskRow::from_row(&row).map_err(query_err)?.into_task())
            .transpose()
    }

    async fn get_task_by_batch_id(&self, batch_id: &str) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| TaskRow::from_row(&row).map_err(query_err)?.into_task())
            .transpose()
    }

    async fn attach_message(&self, task: &Task, message: &Message) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let result = sqlx::query(
            "UPDATE tasks SET message_ids = ?, message_count = ?, aggregated_content = ? WHERE id = ?",
        )
        .bind(to_json(&task.message_ids)?)
        .bind(task.message_count as i64)
        .bind(&task.aggregated_content)
        .bind(task.id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        let result = sqlx::query("UPDATE messages SET task_id = ?, status = ? WHERE id = ?")
            .bind(message.task_id.map(|id| id.to_string()))
            .bind(message.status.to_string())
            .bind(message.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        tx.commit().await.map_err(query_err)
    }

    async fn mark_dispatched(
        &self,
        task_id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let result = sqlx::query("UPDATE tasks SET dispatched_at = ? WHERE id = ?")
            .bind(format_datetime(&at))
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query(
            r#"UPDATE messages
               SET metadata = json_set(metadata, '$.aggregated', json('true'))
               WHERE id IN (SELECT value FROM json_each((SELECT message_ids FROM tasks WHERE id = ?)))"#,
        )
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)
    }

    async fn mark_processing(
        &self,
        task_id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'processing', processed_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(format_datetime(&at))
        .bind(task_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_task(task_id).await? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC, id ASC")
            .bind(status.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        rows_to_tasks(&rows)
    }

    async fn count_tasks_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, RepositoryError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS cnt FROM tasks GROUP BY status ORDER BY status")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(query_err)?;
                let count: i64 = row.try_get("cnt").map_err(query_err)?;
                let status: TaskStatus = status.parse().map_err(RepositoryError::Query)?;
                Ok((status, count as u64))
            })
            .collect()
    }

    async fn record_batch_success(&self, outcome: &BatchSuccess) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let completed_at = format_datetime(&outcome.completed_at);

        finish_task(
            &mut tx,
            &outcome.task_id,
            TaskStatus::Completed,
            Some(&outcome.response),
            None,
            &outcome.completed_at,
        )
        .await?;

        for id in &outcome.member_ids {
            sqlx::query("UPDATE messages SET status = 'sent', sent_at = ?, error = NULL WHERE id = ?")
                .bind(&completed_at)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        insert_message(&mut tx, &outcome.reply).await?;

        sqlx::query(
            "UPDATE conversations SET remote_id = COALESCE(remote_id, ?), last_active_at = ? WHERE id = ?",
        )
        .bind(&outcome.remote_conversation_id)
        .bind(&completed_at)
        .bind(outcome.conversation_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        let entry = RetryHistoryEntry {
            timestamp: outcome.completed_at,
            outcome: RetryOutcome::Succeeded,
            retry_task_id: outcome.task_id,
            error: None,
            context: retry_context(outcome.retry.as_ref()),
        };
        close_failures(
            &mut tx,
            &outcome.member_ids,
            &entry,
            outcome.retry.as_ref(),
            &outcome.completed_at,
        )
        .await?;

        tx.commit().await.map_err(query_err)
    }

    async fn record_batch_failure(&self, outcome: &BatchFailure) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        finish_task(
            &mut tx,
            &outcome.task_id,
            outcome.status,
            None,
            Some(&outcome.error),
            &outcome.failed_at,
        )
        .await?;

        for id in &outcome.member_ids {
            sqlx::query(
                "UPDATE messages SET status = 'failed', error = ?, retry_count = retry_count + 1 WHERE id = ?",
            )
            .bind(&outcome.error)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        let entry = RetryHistoryEntry {
            timestamp: outcome.failed_at,
            outcome: RetryOutcome::Failed,
            retry_task_id: outcome.task_id,
            error: Some(outcome.error.clone()),
            context: retry_context(outcome.retry.as_ref()),
        };
        close_failures(
            &mut tx,
            &outcome.member_ids,
            &entry,
            outcome.retry.as_ref(),
            &outcome.failed_at,
        )
        .await?;

        for failure in &outcome.failures {
            insert_failure(&mut tx, failure).await?;
        }

        tx.commit().await.map_err(query_err)
    }

    async fn abandon_task(
        &self,
        task_id: &Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"UPDATE tasks SET status = 'failed', error = ?, completed_at = ?
               WHERE id = ? AND status = 'processing'"#,
        )
        .bind(error)
        .bind(format_datetime(&at))
        .bind(task_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }
}

//! SQLite failure-record repository.
//!
//! Retry claims are leases: `try_claim` is a single conditional UPDATE, so two
//! concurrent callers can never both hold a live claim on the same record.

use chrono::{DateTime, Utc};
use parley_core::repository::{FailureFilter, FailureStore};
use parley_types::error::RepositoryError;
use parley_types::failure::{FailedMessage, RetryClaim};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, query_err};

/// SQLite-backed implementation of `FailureStore`.
pub struct SqliteFailureRepository {
    pool: DatabasePool,
}

impl SqliteFailureRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct FailedMessageRow {
    id: String,
    message_id: String,
    task_id: Option<String>,
    error: String,
    attempts: i64,
    failed_at: String,
    context: String,
    retried: bool,
    correlation_id: Option<String>,
    retry_history: String,
    claim_token: Option<String>,
    claim_expires_at: Option<String>,
}

impl FailedMessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            task_id: row.try_get("task_id")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
            failed_at: row.try_get("failed_at")?,
            context: row.try_get("context")?,
            retried: row.try_get("retried")?,
            correlation_id: row.try_get("correlation_id")?,
            retry_history: row.try_get("retry_history")?,
            claim_token: row.try_get("claim_token")?,
            claim_expires_at: row.try_get("claim_expires_at")?,
        })
    }

    fn into_failed(self) -> Result<FailedMessage, RepositoryError> {
        let claim = match (self.claim_token, self.claim_expires_at) {
            (Some(token), Some(expires_at)) => Some(RetryClaim {
                token: parse_uuid(&token, "claim_token")?,
                expires_at: parse_datetime(&expires_at)?,
            }),
            _ => None,
        };

        Ok(FailedMessage {
            id: parse_uuid(&self.id, "failed message id")?,
            message_id: parse_uuid(&self.message_id, "message_id")?,
            task_id: self
                .task_id
                .as_deref()
                .map(|s| parse_uuid(s, "task_id"))
                .transpose()?,
            error: self.error,
            attempts: self.attempts as u32,
            failed_at: parse_datetime(&self.failed_at)?,
            context: parse_json(&self.context, "failure context")?,
            retried: self.retried,
            correlation_id: self.correlation_id,
            retry_history: parse_json(&self.retry_history, "retry_history")?,
            claim,
        })
    }
}

fn rows_to_failed(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<FailedMessage>, RepositoryError> {
    rows.iter()
        .map(|row| FailedMessageRow::from_row(row).map_err(query_err)?.into_failed())
        .collect()
}

impl FailureStore for SqliteFailureRepository {
    async fn get_failed(&self, id: &Uuid) -> Result<Option<FailedMessage>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM failed_messages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| FailedMessageRow::from_row(&row).map_err(query_err)?.into_failed())
            .transpose()
    }

    async fn list_failed(
        &self,
        filter: &FailureFilter,
    ) -> Result<Vec<FailedMessage>, RepositoryError> {
        let mut sql = String::from("SELECT * FROM failed_messages WHERE 1 = 1");
        if filter.retried.is_some() {
            sql.push_str(" AND retried = ?");
        }
        if filter.task_id.is_some() {
            sql.push_str(" AND task_id = ?");
        }
        sql.push_str(" ORDER BY failed_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql);
        if let Some(retried) = filter.retried {
            query = query.bind(retried);
        }
        if let Some(task_id) = filter.task_id {
            query = query.bind(task_id.to_string());
        }

        let rows = query.fetch_all(&self.pool.reader).await.map_err(query_err)?;
        rows_to_failed(&rows)
    }

    async fn list_unretried_for_task(
        &self,
        task_id: &Uuid,
    ) -> Result<Vec<FailedMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM failed_messages WHERE task_id = ? AND retried = 0 ORDER BY failed_at ASC, id ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        rows_to_failed(&rows)
    }

    async fn try_claim(
        &self,
        id: &Uuid,
        token: &Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let token = token.to_string();
        let result = sqlx::query(
            r#"UPDATE failed_messages
               SET claim_token = ?, claim_expires_at = ?
               WHERE id = ?
                 AND retried = 0
                 AND (claim_token IS NULL OR claim_token = ? OR claim_expires_at <= ?)"#,
        )
        .bind(&token)
        .bind(format_datetime(&expires_at))
        .bind(id.to_string())
        .bind(&token)
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_claim(
        &self,
        id: &Uuid,
        token: &Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE failed_messages SET claim_expires_at = ?
               WHERE id = ? AND retried = 0 AND claim_token = ?"#,
        )
        .bind(format_datetime(&expires_at))
        .bind(id.to_string())
        .bind(token.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, id: &Uuid, token: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE failed_messages SET claim_token = NULL, claim_expires_at = NULL WHERE id = ? AND claim_token = ?",
        )
        .bind(id.to_string())
        .bind(token.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn count_unretried(&self) -> Result<u64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM failed_messages WHERE retried = 0")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_err)?;
        let count: i64 = row.try_get("cnt").map_err(query_err)?;
        Ok(count as u64)
    }
}

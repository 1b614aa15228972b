//! Retry coordinator.
//!
//! Validates and claims failure records, then hands a retry work item to the
//! dispatch queue and returns immediately. The claim is a conditional update
//! with a lease, so two concurrent retries of the same record cannot both
//! proceed, and a crashed retry becomes retriable again once its lease ends.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parley_types::error::PipelineError;
use parley_types::work::{RetryWorkItem, WorkItem};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::dispatch::DispatchQueue;
use crate::repository::{BatchStore, FailureStore};

/// Acknowledgement that a retry was claimed and queued.
#[derive(Debug, Clone, Serialize)]
pub struct RetryReceipt {
    pub failed_message_id: Uuid,
    pub task_id: Option<Uuid>,
    pub retry_whole_batch: bool,
    pub claim_token: Uuid,
    pub claim_expires_at: DateTime<Utc>,
}

/// Per-id result of a bulk retry.
#[derive(Debug, Clone, Serialize)]
pub struct RetryAttempt {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryManyReport {
    /// True when every requested id was queued.
    pub success: bool,
    pub results: BTreeMap<Uuid, RetryAttempt>,
}

/// Result of retrying every failure of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRetryReport {
    pub success: bool,
    pub message: String,
    pub task_id: Option<Uuid>,
    pub batch_id: Option<String>,
    pub failed_message_ids: Vec<Uuid>,
    pub claim_token: Option<Uuid>,
}

impl TaskRetryReport {
    fn nothing_to_retry(task_ref: &str, task_id: Option<Uuid>, batch_id: Option<String>) -> Self {
        Self {
            success: false,
            message: format!("No failed messages found for task {task_ref}"),
            task_id,
            batch_id,
            failed_message_ids: Vec::new(),
            claim_token: None,
        }
    }
}

pub struct RetryCoordinator<B, F, Q, C> {
    store: Arc<B>,
    failures: Arc<F>,
    queue: Arc<Q>,
    clock: Arc<C>,
    claim_ttl: Duration,
}

impl<B, F, Q, C> RetryCoordinator<B, F, Q, C>
where
    B: BatchStore,
    F: FailureStore,
    Q: DispatchQueue,
    C: Clock,
{
    pub fn new(
        store: Arc<B>,
        failures: Arc<F>,
        queue: Arc<Q>,
        clock: Arc<C>,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            store,
            failures,
            queue,
            clock,
            claim_ttl,
        }
    }

    /// Claim one failure record and queue its retry.
    ///
    /// With `retry_whole_batch`, the executor also picks up every sibling
    /// failure of the same task that it can claim.
    pub async fn retry(
        &self,
        failed_message_id: Uuid,
        task_id: Option<Uuid>,
        context: serde_json::Value,
        retry_whole_batch: bool,
    ) -> Result<RetryReceipt, PipelineError> {
        let record = self
            .failures
            .get_failed(&failed_message_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("failed message", failed_message_id))?;

        if record.retried {
            return Err(PipelineError::AlreadyRetried(failed_message_id));
        }
        if let (Some(requested), Some(owner)) = (task_id, record.task_id) {
            if requested != owner {
                return Err(PipelineError::Validation(format!(
                    "failed message {failed_message_id} does not belong to task {requested}"
                )));
            }
        }

        let now = self.clock.now();
        if record.is_claimed(now) {
            return Err(PipelineError::RetryInProgress(failed_message_id));
        }

        let token = Uuid::now_v7();
        let expires_at = now + self.claim_ttl;
        if !self
            .failures
            .try_claim(&failed_message_id, &token, now, expires_at)
            .await?
        {
            // Lost a race with another caller.
            let latest = self.failures.get_failed(&failed_message_id).await?;
            return Err(match latest {
                Some(r) if r.retried => PipelineError::AlreadyRetried(failed_message_id),
                _ => PipelineError::RetryInProgress(failed_message_id),
            });
        }

        let scope = task_id.or(record.task_id);
        let retry_whole_batch = retry_whole_batch && scope.is_some();
        let item = WorkItem::Retry(RetryWorkItem {
            failed_message_id,
            task_id: scope,
            context,
            retry_whole_batch,
            claim_token: token,
        });

        if let Err(e) = self.queue.enqueue(item) {
            self.failures.release_claim(&failed_message_id, &token).await?;
            return Err(e.into());
        }

        info!(
            failed_message_id = %failed_message_id,
            task_id = ?scope,
            retry_whole_batch,
            "retry queued"
        );

        Ok(RetryReceipt {
            failed_message_id,
            task_id: scope,
            retry_whole_batch,
            claim_token: token,
            claim_expires_at: expires_at,
        })
    }

    /// Retry several records independently. One failure never aborts the rest.
    pub async fn retry_many(
        &self,
        failed_message_ids: &[Uuid],
        context: serde_json::Value,
    ) -> RetryManyReport {
        let mut results = BTreeMap::new();
        for id in failed_message_ids {
            let attempt = match self.retry(*id, None, context.clone(), false).await {
                Ok(_) => RetryAttempt {
                    success: true,
                    message: "retry queued".to_string(),
                },
                Err(e) => {
                    warn!(failed_message_id = %id, error = %e, "retry rejected");
                    RetryAttempt {
                        success: false,
                        message: e.to_string(),
                    }
                }
            };
            results.insert(*id, attempt);
        }

        RetryManyReport {
            success: !results.is_empty() && results.values().all(|r| r.success),
            results,
        }
    }

    /// Retry every unretried failure of a task, addressed by primary key.
    pub async fn retry_by_task_id(
        &self,
        task_id: Uuid,
        context: serde_json::Value,
    ) -> Result<TaskRetryReport, PipelineError> {
        let batch_id = self
            .store
            .get_task(&task_id)
            .await?
            .map(|task| task.batch_id);
        self.retry_task_scope(task_id, batch_id, context).await
    }

    /// Retry every unretried failure of a task, addressed by its batch id.
    pub async fn retry_by_request_task_id(
        &self,
        batch_id: &str,
        context: serde_json::Value,
    ) -> Result<TaskRetryReport, PipelineError> {
        match self.store.get_task_by_batch_id(batch_id).await? {
            Some(task) => {
                self.retry_task_scope(task.id, Some(task.batch_id), context)
                    .await
            }
            None => Ok(TaskRetryReport::nothing_to_retry(
                batch_id,
                None,
                Some(batch_id.to_string()),
            )),
        }
    }

    async fn retry_task_scope(
        &self,
        task_id: Uuid,
        batch_id: Option<String>,
        context: serde_json::Value,
    ) -> Result<TaskRetryReport, PipelineError> {
        let pending = self.failures.list_unretried_for_task(&task_id).await?;
        if pending.is_empty() {
            return Ok(TaskRetryReport::nothing_to_retry(
                &task_id.to_string(),
                Some(task_id),
                batch_id,
            ));
        }

        let now = self.clock.now();
        let token = Uuid::now_v7();
        let expires_at = now + self.claim_ttl;
        let mut claimed = Vec::new();
        for failure in &pending {
            if self
                .failures
                .try_claim(&failure.id, &token, now, expires_at)
                .await?
            {
                claimed.push(failure.id);
            }
        }

        let Some(first) = claimed.first().copied() else {
            return Ok(TaskRetryReport {
                success: false,
                message: format!(
                    "Every failed message of task {task_id} already has a retry in progress"
                ),
                task_id: Some(task_id),
                batch_id,
                failed_message_ids: Vec::new(),
                claim_token: None,
            });
        };

        let item = WorkItem::Retry(RetryWorkItem {
            failed_message_id: first,
            task_id: Some(task_id),
            context,
            retry_whole_batch: true,
            claim_token: token,
        });
        if let Err(e) = self.queue.enqueue(item) {
            for id in &claimed {
                self.failures.release_claim(id, &token).await?;
            }
            return Err(e.into());
        }

        info!(task_id = %task_id, count = claimed.len(), "task retry queued");
        Ok(TaskRetryReport {
            success: true,
            message: format!(
                "Retry queued for {} failed message(s) of task {task_id}",
                claimed.len()
            ),
            task_id: Some(task_id),
            batch_id,
            failed_message_ids: claimed,
            claim_token: Some(token),
        })
    }
}

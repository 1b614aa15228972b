//! Retry executor.
//!
//! Runs a claimed retry: re-checks the claim, gathers the target message (or,
//! for a whole-batch retry, every sibling failure it can also claim), opens a
//! fresh retry task linked to the original via `retry_of` metadata, and runs
//! it through the batch worker. The worker's outcome transaction marks every
//! covered failure record retried and appends its history entry.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parley_types::error::PipelineError;
use parley_types::failure::FailedMessage;
use parley_types::task::{META_RETRY_OF, Task};
use parley_types::work::{BatchWorkItem, RetryLink, RetryWorkItem};
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::ChatBackend;
use crate::batch::content::OrdinalLabel;
use crate::batch::membership;
use crate::batch::worker::{BatchOutcome, BatchWorker};
use crate::clock::Clock;
use crate::repository::{BatchStore, FailureStore, SettingsRepository};

/// Slack on top of the request timeout for the store writes around the call.
const LEASE_MARGIN_SECS: i64 = 30;

pub struct RetryExecutor<B, F, S, K, C> {
    store: Arc<B>,
    failures: Arc<F>,
    worker: Arc<BatchWorker<B, S, K, C>>,
    clock: Arc<C>,
    label: OrdinalLabel,
    claim_ttl: Duration,
}

impl<B, F, S, K, C> RetryExecutor<B, F, S, K, C>
where
    B: BatchStore,
    F: FailureStore,
    S: SettingsRepository,
    K: ChatBackend,
    C: Clock,
{
    pub fn new(
        store: Arc<B>,
        failures: Arc<F>,
        worker: Arc<BatchWorker<B, S, K, C>>,
        clock: Arc<C>,
        label: OrdinalLabel,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            store,
            failures,
            worker,
            clock,
            label,
            claim_ttl,
        }
    }

    pub async fn execute(&self, item: RetryWorkItem) -> Result<BatchOutcome, PipelineError> {
        let record = self
            .failures
            .get_failed(&item.failed_message_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("failed message", item.failed_message_id))?;

        if record.retried {
            return Err(PipelineError::AlreadyRetried(record.id));
        }

        // The lease taken at claim time only covered the queue wait. Before
        // calling out, stretch it past the longest this run can take.
        let expires_at = self.clock.now() + self.execution_lease().await?;
        if !self
            .failures
            .renew_claim(&record.id, &item.claim_token, expires_at)
            .await?
        {
            // Lease expired and someone else claimed the record.
            return Err(PipelineError::RetryInProgress(record.id));
        }

        let targets = self.gather_targets(record, &item, expires_at).await?;
        let message_ids: Vec<Uuid> = targets.iter().map(|f| f.message_id).collect();
        let mut messages = self.store.get_messages(&message_ids).await?;
        let Some(conversation_id) = messages.first().map(|m| m.conversation_id) else {
            return Err(PipelineError::not_found("message", targets[0].message_id));
        };
        messages.retain(|m| m.conversation_id == conversation_id);
        messages.sort_by_key(|m| (m.created_at, m.id));

        let now = self.clock.now();
        let mut task = Task::open(conversation_id, now);
        let retry_of: BTreeSet<String> = targets
            .iter()
            .filter_map(|f| f.task_id)
            .map(|id| id.to_string())
            .collect();
        task.metadata
            .insert(META_RETRY_OF.to_string(), serde_json::json!(retry_of));
        self.store.create_task(&task).await?;

        let mut members = Vec::with_capacity(messages.len());
        for mut message in messages {
            membership::adopt(&mut task, &mut members, &mut message, &self.label)?;
            self.store.attach_message(&task, &message).await?;
        }
        self.store.mark_dispatched(&task.id, now).await?;
        task.dispatched_at = Some(now);

        info!(
            retry_task_id = %task.id,
            batch_id = %task.batch_id,
            retry_of = ?retry_of,
            message_count = task.message_count,
            "running retry batch"
        );

        self.worker
            .execute(BatchWorkItem {
                aggregated_content: task.aggregated_content.clone(),
                task,
                messages: members,
                retry: Some(RetryLink {
                    claim_token: item.claim_token,
                    failed_message_ids: targets.iter().map(|f| f.id).collect(),
                    context: item.context,
                }),
            })
            .await
    }

    /// Lease length for a run: the configured claim TTL, or the request
    /// timeout plus a margin when that is longer.
    async fn execution_lease(&self) -> Result<Duration, PipelineError> {
        let request = self
            .worker
            .request_timeout_secs()
            .await?
            .map(|secs| Duration::seconds(secs as i64 + LEASE_MARGIN_SECS))
            .unwrap_or_else(Duration::zero);
        Ok(self.claim_ttl.max(request))
    }

    /// The claimed record, plus each sibling it can claim when retrying the
    /// whole batch. At most one record per message.
    async fn gather_targets(
        &self,
        record: FailedMessage,
        item: &RetryWorkItem,
        expires_at: DateTime<Utc>,
    ) -> Result<Vec<FailedMessage>, PipelineError> {
        let mut targets = vec![record];
        let (true, Some(task_id)) = (item.retry_whole_batch, item.task_id) else {
            return Ok(targets);
        };

        let now = self.clock.now();
        for sibling in self.failures.list_unretried_for_task(&task_id).await? {
            if targets
                .iter()
                .any(|t| t.id == sibling.id || t.message_id == sibling.message_id)
            {
                continue;
            }
            if self
                .failures
                .try_claim(&sibling.id, &item.claim_token, now, expires_at)
                .await?
            {
                targets.push(sibling);
            } else {
                debug!(failed_message_id = %sibling.id, "sibling claimed elsewhere, skipping");
            }
        }
        Ok(targets)
    }
}

//! Startup recovery of batches left in flight by a previous process.
//!
//! Aggregator state is in-memory only, so after a restart the store is the
//! source of truth:
//! - pending tasks that were dispatched (or still open with members) are
//!   enqueued again; delivery is at-least-once;
//! - tasks left `processing` are reduced to failure with status `timeout`,
//!   which makes their members retriable.

use chrono::{DateTime, Utc};
use parley_types::error::PipelineError;
use parley_types::message::META_AGGREGATED;
use parley_types::task::TaskStatus;
use parley_types::work::{BatchWorkItem, WorkItem};
use serde::Serialize;
use tracing::{info, warn};

use super::worker::{BatchOutcome, BatchWorker, FailureCause};
use crate::backend::ChatBackend;
use crate::clock::Clock;
use crate::dispatch::DispatchQueue;
use crate::repository::{BatchStore, SettingsRepository};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Dispatched-but-pending tasks enqueued again.
    pub requeued: usize,
    /// Undispatched tasks with members that were closed and enqueued.
    pub orphaned: usize,
    /// Processing tasks reduced to `timeout`.
    pub timed_out: usize,
}

pub async fn recover_in_flight<B, S, K, C, Q>(
    store: &B,
    queue: &Q,
    worker: &BatchWorker<B, S, K, C>,
    now: DateTime<Utc>,
) -> Result<RecoveryReport, PipelineError>
where
    B: BatchStore,
    S: SettingsRepository,
    K: ChatBackend,
    C: Clock,
    Q: DispatchQueue,
{
    let mut report = RecoveryReport::default();

    for mut task in store.list_tasks_by_status(TaskStatus::Pending).await? {
        if task.message_count == 0 {
            continue;
        }

        let mut messages = store.get_messages(&task.message_ids).await?;
        if task.dispatched_at.is_none() {
            store.mark_dispatched(&task.id, now).await?;
            task.dispatched_at = Some(now);
            for message in &mut messages {
                message
                    .metadata
                    .insert(META_AGGREGATED.to_string(), serde_json::Value::Bool(true));
            }
            report.orphaned += 1;
        } else {
            report.requeued += 1;
        }

        info!(task_id = %task.id, batch_id = %task.batch_id, "re-enqueueing batch");
        queue.enqueue(WorkItem::Batch(BatchWorkItem {
            aggregated_content: task.aggregated_content.clone(),
            task,
            messages,
            retry: None,
        }))?;
    }

    for task in store.list_tasks_by_status(TaskStatus::Processing).await? {
        let members = store.get_messages(&task.message_ids).await?;
        warn!(task_id = %task.id, batch_id = %task.batch_id, "batch interrupted mid-flight");
        let outcome = worker
            .record_failure(
                &task,
                &members,
                &FailureCause::interrupted(),
                TaskStatus::Timeout,
                None,
            )
            .await?;
        // A live worker may have finished the task since it was listed.
        if matches!(outcome, BatchOutcome::Failed { .. }) {
            report.timed_out += 1;
        }
    }

    if report != RecoveryReport::default() {
        info!(
            requeued = report.requeued,
            orphaned = report.orphaned,
            timed_out = report.timed_out,
            "recovered in-flight batches"
        );
    }
    Ok(report)
}

//! Routes dequeued work items to the batch worker or the retry executor.

use std::sync::Arc;

use parley_types::error::{ErrorKind, PipelineError};
use parley_types::work::WorkItem;
use tracing::{error, info, warn};

use crate::backend::ChatBackend;
use crate::batch::worker::{BatchOutcome, BatchWorker};
use crate::clock::Clock;
use crate::dispatch::WorkHandler;
use crate::repository::{BatchStore, FailureStore, SettingsRepository};
use crate::retry::executor::RetryExecutor;

pub struct PipelineHandler<B, F, S, K, C> {
    worker: Arc<BatchWorker<B, S, K, C>>,
    retries: Arc<RetryExecutor<B, F, S, K, C>>,
}

impl<B, F, S, K, C> PipelineHandler<B, F, S, K, C>
where
    B: BatchStore,
    F: FailureStore,
    S: SettingsRepository,
    K: ChatBackend,
    C: Clock,
{
    pub fn new(
        worker: Arc<BatchWorker<B, S, K, C>>,
        retries: Arc<RetryExecutor<B, F, S, K, C>>,
    ) -> Self {
        Self { worker, retries }
    }

    pub async fn process(&self, item: WorkItem) -> Result<BatchOutcome, PipelineError> {
        match item {
            WorkItem::Batch(batch) => self.worker.execute(batch).await,
            WorkItem::Retry(retry) => self.retries.execute(retry).await,
        }
    }
}

impl<B, F, S, K, C> WorkHandler for PipelineHandler<B, F, S, K, C>
where
    B: BatchStore,
    F: FailureStore,
    S: SettingsRepository,
    K: ChatBackend,
    C: Clock,
{
    async fn handle(&self, item: WorkItem) {
        let label = item.label();
        match self.process(item).await {
            Ok(BatchOutcome::Completed { task_id, .. }) => {
                info!(work = %label, task_id = %task_id, "work item completed");
            }
            Ok(BatchOutcome::Failed { task_id, error }) => {
                warn!(work = %label, task_id = %task_id, error = %error, "work item failed");
            }
            Ok(BatchOutcome::Skipped { task_id }) => {
                info!(work = %label, task_id = %task_id, "work item skipped");
            }
            Ok(BatchOutcome::Superseded { task_id, reason }) => {
                warn!(work = %label, task_id = %task_id, reason = %reason, "work item superseded");
            }
            Err(e) if e.kind() == ErrorKind::AlreadyRetried => {
                info!(work = %label, error = %e, "retry superseded");
            }
            Err(e) => error!(work = %label, error = %e, "work item aborted"),
        }
    }
}

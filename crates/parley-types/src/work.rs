//! Dispatch queue work items.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;
use crate::task::Task;

/// A unit of work handed from the aggregator or retry coordinator to the
/// worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    Batch(BatchWorkItem),
    Retry(RetryWorkItem),
}

impl WorkItem {
    pub fn label(&self) -> &'static str {
        match self {
            WorkItem::Batch(_) => "batch",
            WorkItem::Retry(_) => "retry",
        }
    }
}

/// A closed batch ready for the remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchWorkItem {
    pub task: Task,
    /// Members in batch order.
    pub messages: Vec<Message>,
    pub aggregated_content: String,
    /// Present when the batch carries a retry of earlier failures.
    pub retry: Option<RetryLink>,
}

/// Links a retry batch back to the failure records it retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLink {
    pub claim_token: Uuid,
    pub failed_message_ids: Vec<Uuid>,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// A claimed retry of one failure record, optionally widened to its batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryWorkItem {
    pub failed_message_id: Uuid,
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub context: serde_json::Value,
    pub retry_whole_batch: bool,
    pub claim_token: Uuid,
}

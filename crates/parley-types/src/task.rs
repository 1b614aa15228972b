//! Batch task types.
//!
//! A task is the unit of dispatch: an ordered group of user messages from one
//! conversation, aggregated into a single remote request. Tasks accept new
//! members only until they are dispatched, and are immutable once terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

use crate::Metadata;

/// Metadata key recording the conversation a task aggregates.
pub const META_CONVERSATION_ID: &str = "conversation_id";
/// Metadata key recording when the aggregation window opened.
pub const META_WINDOW_START: &str = "window_start";
/// Metadata key on retry tasks naming the task ids being retried.
pub const META_RETRY_OF: &str = "retry_of";

/// Processing status of a task.
///
/// `pending -> processing -> completed | failed | timeout`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Timeout => write!(f, "timeout"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "timeout" => Ok(TaskStatus::Timeout),
            other => Err(format!("invalid task status: '{other}'")),
        }
    }
}

/// A batch of messages dispatched together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Opaque, globally unique batch identifier (`batch_<hex>`).
    pub batch_id: String,
    pub conversation_id: Uuid,
    pub status: TaskStatus,
    /// Ordered member message ids, in arrival order.
    pub message_ids: Vec<Uuid>,
    pub aggregated_content: String,
    pub message_count: u32,
    #[serde(default)]
    pub metadata: Metadata,
    pub response: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the batch is handed to the dispatch queue; frozen afterwards.
    pub dispatched_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Open a new, empty batch for a conversation.
    pub fn open(conversation_id: Uuid, window_start: DateTime<Utc>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(
            META_CONVERSATION_ID.to_string(),
            serde_json::Value::String(conversation_id.to_string()),
        );
        metadata.insert(
            META_WINDOW_START.to_string(),
            serde_json::Value::String(window_start.to_rfc3339()),
        );

        Self {
            id: Uuid::now_v7(),
            batch_id: generate_batch_id(),
            conversation_id,
            status: TaskStatus::Pending,
            message_ids: Vec::new(),
            aggregated_content: String::new(),
            message_count: 0,
            metadata,
            response: None,
            error: None,
            created_at: window_start,
            dispatched_at: None,
            processed_at: None,
            completed_at: None,
        }
    }

    /// Whether the task can still accept new members.
    pub fn is_open(&self) -> bool {
        self.dispatched_at.is_none() && !self.status.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Task ids this task retries, if it is a retry batch.
    pub fn retry_of(&self) -> Vec<Uuid> {
        self.metadata
            .get(META_RETRY_OF)
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Generate a fresh opaque batch identifier.
pub fn generate_batch_id() -> String {
    format!("batch_{}", Uuid::now_v7().simple())
}

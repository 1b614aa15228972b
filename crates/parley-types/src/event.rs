//! Batch outcome notifications.
//!
//! Published on the event bus by the batch worker after each batch outcome
//! has been persisted. Subscribers (for example a UI bridge or the API's
//! logging subscriber) observe them without affecting delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome carried by a [`BatchEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEventKind {
    Succeeded { content: String },
    Failed { error: String },
}

/// Notification emitted after a batch outcome is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEvent {
    pub conversation_id: Uuid,
    pub task_id: Uuid,
    pub batch_id: String,
    pub kind: BatchEventKind,
    /// Last member of the batch.
    pub triggering_message_id: Option<Uuid>,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

impl BatchEvent {
    pub fn is_success(&self) -> bool {
        matches!(self.kind, BatchEventKind::Succeeded { .. })
    }
}

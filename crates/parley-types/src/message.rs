//! Message types.
//!
//! A message is a single turn in a conversation. User messages start out
//! `pending`, join exactly one open batch, and end up `sent` or `failed`
//! once the batch worker reduces the remote outcome. Assistant replies are
//! created directly in the `received` state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

use crate::Metadata;

/// Metadata key holding the timestamp at which a message was buffered.
pub const META_AGGREGATED_AT: &str = "aggregated_at";
/// Metadata key set once the message's batch has been handed to the queue.
pub const META_AGGREGATED: &str = "aggregated";
/// Metadata key holding the remote service's own message identifier.
pub const META_REMOTE_MESSAGE_ID: &str = "remote_message_id";
/// Metadata key on assistant replies pointing at the originating task.
pub const META_TASK_ID: &str = "task_id";
/// Metadata key on assistant replies pointing at the originating batch id.
pub const META_BATCH_ID: &str = "batch_id";
/// Metadata key on assistant replies listing the answered user messages.
pub const META_MEMBER_MESSAGE_IDS: &str = "member_message_ids";

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Sent,
    Received,
    Failed,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Pending => write!(f, "pending"),
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Received => write!(f, "received"),
            MessageStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(MessageStatus::Pending),
            "sent" => Ok(MessageStatus::Sent),
            "received" => Ok(MessageStatus::Received),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("invalid message status: '{other}'")),
        }
    }
}

/// A single turn within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Batch this message currently belongs to (exclusive membership).
    pub task_id: Option<Uuid>,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a pending user message tagged with its aggregation timestamp.
    pub fn user(conversation_id: Uuid, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(
            META_AGGREGATED_AT.to_string(),
            serde_json::Value::String(now.to_rfc3339()),
        );

        Self {
            id: Uuid::now_v7(),
            conversation_id,
            task_id: None,
            role: MessageRole::User,
            content: content.into(),
            status: MessageStatus::Pending,
            retry_count: 0,
            error: None,
            metadata,
            created_at: now,
            sent_at: None,
        }
    }

    /// Create an assistant reply that has already been received.
    pub fn assistant(
        conversation_id: Uuid,
        content: impl Into<String>,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            conversation_id,
            task_id: None,
            role: MessageRole::Assistant,
            content: content.into(),
            status: MessageStatus::Received,
            retry_count: 0,
            error: None,
            metadata,
            created_at: now,
            sent_at: None,
        }
    }

    /// Whether the message's batch has already been handed to the queue.
    pub fn is_aggregated(&self) -> bool {
        self.metadata
            .get(META_AGGREGATED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

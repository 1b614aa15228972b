//! Conversation types.
//!
//! A conversation is the logical chat thread that owns messages. The remote
//! identifier is unknown until the first successful exchange with the remote
//! service and is persisted back by the batch worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a conversation.
///
/// Maps to the CHECK constraint in the SQLite schema:
/// `CHECK (status IN ('active', 'inactive', 'archived'))`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Inactive,
    Archived,
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationStatus::Active => write!(f, "active"),
            ConversationStatus::Inactive => write!(f, "inactive"),
            ConversationStatus::Archived => write!(f, "archived"),
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ConversationStatus::Active),
            "inactive" => Ok(ConversationStatus::Inactive),
            "archived" => Ok(ConversationStatus::Archived),
            other => Err(format!("invalid conversation status: '{other}'")),
        }
    }
}

/// A chat thread between the local user and the remote service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    /// Identifier assigned by the remote service, once known.
    pub remote_id: Option<String>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Conversation {
    /// Start a new active conversation with no remote identifier yet.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            remote_id: None,
            status: ConversationStatus::Active,
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.status == ConversationStatus::Archived
    }
}

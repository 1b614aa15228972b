//! Failure records and retry bookkeeping.
//!
//! A `FailedMessage` is written for every member of a batch whose remote call
//! failed. It snapshots enough of the message to replay it later, and carries
//! a lease-based claim so that at most one retry of a record is in flight.
//! Once `retried` is set the record is frozen apart from its history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

use crate::message::MessageRole;

/// Structured context captured at failure time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Class of the error that caused the failure (e.g. `RemoteError::Status`).
    pub exception_class: String,
    /// Machine-readable error code, such as the HTTP status.
    pub exception_code: Option<String>,
    /// Snapshot of the message content.
    pub content: String,
    pub role: MessageRole,
    pub task_id: Option<Uuid>,
    /// True when the failure came out of batch processing.
    #[serde(default)]
    pub batch_processing: bool,
}

/// Outcome of one retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryOutcome {
    Succeeded,
    Failed,
}

impl fmt::Display for RetryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryOutcome::Succeeded => write!(f, "succeeded"),
            RetryOutcome::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RetryOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "succeeded" => Ok(RetryOutcome::Succeeded),
            "failed" => Ok(RetryOutcome::Failed),
            other => Err(format!("invalid retry outcome: '{other}'")),
        }
    }
}

/// Append-only history entry recorded for each retry attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub outcome: RetryOutcome,
    /// The new task created to carry the retry.
    pub retry_task_id: Uuid,
    pub error: Option<String>,
    /// Caller-supplied context passed to the retry request.
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Exclusive lease on a failure record held by an in-flight retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryClaim {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl RetryClaim {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A persisted record of a message that failed to be delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMessage {
    pub id: Uuid,
    pub message_id: Uuid,
    pub task_id: Option<Uuid>,
    pub error: String,
    /// Delivery attempts made so far for the message.
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub context: FailureContext,
    pub retried: bool,
    /// External correlation id, e.g. the remote request id.
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub retry_history: Vec<RetryHistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim: Option<RetryClaim>,
}

impl FailedMessage {
    pub fn new(
        message_id: Uuid,
        task_id: Option<Uuid>,
        error: impl Into<String>,
        attempts: u32,
        context: FailureContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            message_id,
            task_id,
            error: error.into(),
            attempts,
            failed_at: now,
            context,
            retried: false,
            correlation_id: None,
            retry_history: Vec::new(),
            claim: None,
        }
    }

    /// Whether another caller currently holds a live retry claim.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claim.map(|c| c.is_live(now)).unwrap_or(false)
    }

    /// Whether the record may be claimed for a new retry right now.
    pub fn is_retriable(&self, now: DateTime<Utc>) -> bool {
        !self.retried && !self.is_claimed(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn context() -> FailureContext {
        FailureContext {
            exception_class: "RemoteError::Status".to_string(),
            exception_code: Some("500".to_string()),
            content: "hello".to_string(),
            role: MessageRole::User,
            task_id: None,
            batch_processing: true,
        }
    }

    #[test]
    fn test_new_failure_is_retriable() {
        let now = Utc::now();
        let failed = FailedMessage::new(Uuid::now_v7(), None, "boom", 1, context(), now);
        assert!(!failed.retried);
        assert!(failed.is_retriable(now));
        assert!(failed.retry_history.is_empty());
    }

    #[test]
    fn test_live_claim_blocks_retry_until_expiry() {
        let now = Utc::now();
        let mut failed = FailedMessage::new(Uuid::now_v7(), None, "boom", 1, context(), now);
        failed.claim = Some(RetryClaim {
            token: Uuid::now_v7(),
            expires_at: now + Duration::seconds(30),
        });

        assert!(failed.is_claimed(now));
        assert!(!failed.is_retriable(now));
        assert!(failed.is_retriable(now + Duration::seconds(31)));
    }

    #[test]
    fn test_retried_record_is_never_retriable() {
        let now = Utc::now();
        let mut failed = FailedMessage::new(Uuid::now_v7(), None, "boom", 1, context(), now);
        failed.retried = true;
        assert!(!failed.is_retriable(now));
    }

    #[test]
    fn test_context_serializes_snake_case_fields() {
        let json = serde_json::to_value(context()).unwrap();
        assert_eq!(json["exception_class"], "RemoteError::Status");
        assert_eq!(json["exception_code"], "500");
        assert_eq!(json["role"], "user");
        assert_eq!(json["batch_processing"], true);
    }
}

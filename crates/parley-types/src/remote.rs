//! Remote chat service request/response types.
//!
//! These model the wire shapes exchanged with the remote conversational
//! service and the errors a backend call can produce.

use serde::{Deserialize, Serialize};

/// One request to the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChatRequest {
    /// Aggregated user input.
    pub query: String,
    /// Remote conversation id, when one has already been assigned.
    pub conversation_id: Option<String>,
    /// User identifier from the active settings.
    pub user: String,
}

/// Successful reply from the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChatReply {
    pub answer: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
}

/// One incremental chunk of a streaming reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Errors from the remote chat service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("no active service configuration")]
    NotConfigured,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("rate limited")]
    RateLimited,

    #[error("server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    #[error("request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("stream error: {0}")]
    Stream(String),
}

impl RemoteError {
    /// Stable class name recorded as `exception_class` in failure context.
    pub fn class(&self) -> &'static str {
        match self {
            RemoteError::NotConfigured => "ConfigurationError",
            RemoteError::Transport(_) => "TransportError",
            RemoteError::AuthenticationFailed => "AuthenticationError",
            RemoteError::RateLimited => "RateLimitError",
            RemoteError::Server { .. } => "ServerError",
            RemoteError::Rejected { .. } => "RequestError",
            RemoteError::Timeout { .. } => "TimeoutError",
            RemoteError::Deserialization(_) => "DeserializationError",
            RemoteError::Stream(_) => "StreamError",
        }
    }

    /// Machine-readable code recorded as `exception_code`, when one exists.
    pub fn code(&self) -> Option<String> {
        match self {
            RemoteError::AuthenticationFailed => Some("401".to_string()),
            RemoteError::RateLimited => Some("429".to_string()),
            RemoteError::Server { status, .. } | RemoteError::Rejected { status, .. } => {
                Some(status.to_string())
            }
            RemoteError::Timeout { .. } => Some("timeout".to_string()),
            _ => None,
        }
    }
}

use thiserror::Error;
use uuid::Uuid;

use crate::remote::RemoteError;

/// Errors from repository operations (used by trait definitions in parley-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Coarse classification of pipeline errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyRetried,
    Transient,
    Fatal,
}

/// Errors surfaced by the aggregation and delivery pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("failed message {0} has already been retried")]
    AlreadyRetried(Uuid),

    #[error("failed message {0} already has a retry in progress")]
    RetryInProgress(Uuid),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        PipelineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::NotFound { .. } => ErrorKind::NotFound,
            PipelineError::AlreadyRetried(_) | PipelineError::RetryInProgress(_) => {
                ErrorKind::AlreadyRetried
            }
            PipelineError::Remote(_) => ErrorKind::Transient,
            PipelineError::Validation(_)
            | PipelineError::Configuration(_)
            | PipelineError::Dispatch(_)
            | PipelineError::Storage(_) => ErrorKind::Fatal,
        }
    }
}

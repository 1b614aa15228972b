//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use parley_types::error::{PipelineError, RepositoryError};

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Errors from the aggregation and delivery pipeline.
    Pipeline(PipelineError),
    /// Malformed request input.
    Validation(String),
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        AppError::Pipeline(e)
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        AppError::Pipeline(e.into())
    }
}

impl AppError {
    /// Status, machine-readable code and message for this error.
    pub fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Pipeline(e) => {
                let (status, code) = match e {
                    PipelineError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                    PipelineError::AlreadyRetried(_) => (StatusCode::CONFLICT, "ALREADY_RETRIED"),
                    PipelineError::RetryInProgress(_) => {
                        (StatusCode::CONFLICT, "RETRY_IN_PROGRESS")
                    }
                    PipelineError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                    PipelineError::Storage(RepositoryError::NotFound) => {
                        (StatusCode::NOT_FOUND, "NOT_FOUND")
                    }
                    PipelineError::Storage(RepositoryError::Conflict(_)) => {
                        (StatusCode::CONFLICT, "CONFLICT")
                    }
                    PipelineError::Storage(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
                    }
                    PipelineError::Configuration(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR")
                    }
                    PipelineError::Dispatch(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "DISPATCH_ERROR")
                    }
                    PipelineError::Remote(_) => (StatusCode::BAD_GATEWAY, "REMOTE_ERROR"),
                };
                (status, code, e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }

        let body = ApiResponse::error(code, &message, uuid::Uuid::now_v7().to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::remote::RemoteError;
    use uuid::Uuid;

    #[test]
    fn pipeline_errors_map_to_statuses() {
        let id = Uuid::now_v7();
        let status = |e: PipelineError| AppError::from(e).parts().0;

        assert_eq!(status(PipelineError::not_found("task", id)), StatusCode::NOT_FOUND);
        assert_eq!(status(PipelineError::AlreadyRetried(id)), StatusCode::CONFLICT);
        assert_eq!(status(PipelineError::RetryInProgress(id)), StatusCode::CONFLICT);
        assert_eq!(
            status(PipelineError::Validation("empty".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(PipelineError::Dispatch("dispatch queue is full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(PipelineError::from(RemoteError::RateLimited)),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn repository_errors_keep_their_meaning() {
        let (status, code, _) = AppError::from(RepositoryError::NotFound).parts();
        assert_eq!((status, code), (StatusCode::NOT_FOUND, "NOT_FOUND"));

        let (status, code, message) =
            AppError::from(RepositoryError::Conflict("batch id taken".into())).parts();
        assert_eq!((status, code), (StatusCode::CONFLICT, "CONFLICT"));
        assert!(message.contains("batch id taken"));
    }

    #[test]
    fn already_retried_has_its_own_code() {
        let id = Uuid::now_v7();
        let (_, code, message) = AppError::from(PipelineError::AlreadyRetried(id)).parts();
        assert_eq!(code, "ALREADY_RETRIED");
        assert!(message.contains(&id.to_string()));
    }
}

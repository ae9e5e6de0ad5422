//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hoster_files::WorkspaceError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::backup::BackupError;
use crate::supervisor::SupervisorError;

/// API error type. The message is forwarded to the client verbatim.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    GatewayTimeout(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::GatewayTimeout(_) => "TIMEOUT",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::GatewayTimeout(msg) => {
                warn!(error_code = code, message = %msg, "Operation timed out");
            }
            _ => {
                debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            status: "error",
            message,
            code,
        };

        (status, Json(body)).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let message = err.to_string();
        match err {
            SupervisorError::AlreadyRunning
            | SupervisorError::NotRunning
            | SupervisorError::OperationInProgress => ApiError::Conflict(message),
            SupervisorError::InvalidCommand(_) => ApiError::BadRequest(message),
            SupervisorError::Timeout => ApiError::GatewayTimeout(message),
            SupervisorError::StartFailed(_) | SupervisorError::Io(_) => ApiError::Internal(message),
        }
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        let message = err.to_string();
        match err {
            WorkspaceError::NotFound(_) => ApiError::NotFound(message),
            WorkspaceError::PathEscapesRoot => ApiError::Forbidden(message),
            WorkspaceError::InvalidFileName(_)
            | WorkspaceError::NotADirectory(_)
            | WorkspaceError::IsADirectory(_) => ApiError::BadRequest(message),
            WorkspaceError::FileTooLarge { .. } => ApiError::PayloadTooLarge(message),
            WorkspaceError::Io(_) => ApiError::Internal(message),
        }
    }
}

impl From<BackupError> for ApiError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::AlreadyInProgress => ApiError::Conflict(err.to_string()),
            BackupError::NotFound(_) => ApiError::NotFound(err.to_string()),
            BackupError::Io(_) | BackupError::Archive(_) => {
                ApiError::Internal(format!("Backup creation failed: {}", err))
            }
        }
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supervisor_error_mapping() {
        assert_eq!(
            ApiError::from(SupervisorError::AlreadyRunning).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(SupervisorError::NotRunning).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(SupervisorError::OperationInProgress).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(SupervisorError::InvalidCommand("empty".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(SupervisorError::Timeout).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::from(SupervisorError::StartFailed("boom".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_workspace_error_mapping() {
        assert_eq!(
            ApiError::from(WorkspaceError::PathEscapesRoot).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(WorkspaceError::NotFound("x".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(WorkspaceError::NotADirectory("x".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(WorkspaceError::FileTooLarge { size: 2, limit: 1 }).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_backup_error_mapping() {
        assert_eq!(
            ApiError::from(BackupError::AlreadyInProgress).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(BackupError::NotFound("ws".into())).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_message_is_forwarded_verbatim() {
        let err = ApiError::from(SupervisorError::AlreadyRunning);
        assert_eq!(err.to_string(), "Server is already running.");
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ApiError::conflict("Server is not running.").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "Server is not running.");
        assert_eq!(json["code"], "CONFLICT");
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Wire identifiers for the closed error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    AuthFailed,
    AuthTimeout,
    ProtocolMismatch,
    NotFound,
    InvariantViolation,
    VersionMismatch,
    ConflictUnresolved,
    Cancelled,
    TimedOut,
    TransportError,
    Internal,
}

impl ErrorCode {
    /// Wire identifier string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "auth-failed",
            ErrorCode::AuthTimeout => "auth-timeout",
            ErrorCode::ProtocolMismatch => "protocol-mismatch",
            ErrorCode::NotFound => "not-found",
            ErrorCode::InvariantViolation => "invariant-violation",
            ErrorCode::VersionMismatch => "version-mismatch",
            ErrorCode::ConflictUnresolved => "conflict-unresolved",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::TimedOut => "timed-out",
            ErrorCode::TransportError => "transport-error",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: i64, actual: i64 },

    #[error("Conflict unresolved: {0}")]
    ConflictUnresolved(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Taxonomy code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::AuthFailed(_) => ErrorCode::AuthFailed,
            AppError::ProtocolMismatch(_) => ErrorCode::ProtocolMismatch,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::InvariantViolation(_) => ErrorCode::InvariantViolation,
            AppError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            AppError::ConflictUnresolved(_) => ErrorCode::ConflictUnresolved,
            AppError::Cancelled(_) => ErrorCode::Cancelled,
            AppError::TimedOut(_) => ErrorCode::TimedOut,
            AppError::Transport(_) => ErrorCode::TransportError,
            AppError::BadRequest(_) => ErrorCode::Internal,
            AppError::Internal(_)
            | AppError::Sqlite(_)
            | AppError::SerdeJson(_)
            | AppError::Anyhow(_) => ErrorCode::Internal,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            AppError::ProtocolMismatch(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvariantViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::VersionMismatch { .. } => StatusCode::CONFLICT,
            AppError::ConflictUnresolved(_) => StatusCode::CONFLICT,
            AppError::Cancelled(_) => StatusCode::BAD_REQUEST,
            AppError::TimedOut(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::Transport(_) => StatusCode::BAD_GATEWAY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SerdeJson(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) | AppError::Sqlite(_) | AppError::Anyhow(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
            "errorCode": self.code().as_str(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("The requested mode is not available on this device")]
    ModeUnavailable,

    #[error("There's already an active mode on the USB Gadget. Call Deactivate first, then retry")]
    AlreadyActive,

    #[error("There's no active mode on the USB Gadget")]
    NoneActive,

    #[error(
        "{owner} is holding the system lock. \
         You cannot activate or deactivate while somebody else is holding the lock"
    )]
    LockHeld { owner: String },

    #[error("The lock is already held by {owner}")]
    AlreadyLocked { owner: String },

    #[error("There is currently no lock active")]
    NoLock,

    #[error(
        "You have been identified as {caller}, while the system lock is held by {owner}. \
         Only {owner} can release the lock"
    )]
    NotOwner { caller: String, owner: String },

    #[error("Another gadget operation is in progress, retry once it has finished")]
    OperationInProgress,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Failed request: {0}")]
    FailedRequest(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub kind: &'static str,
    pub message: String,
}

impl AppError {
    /// Stable wire name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ModeUnavailable => "mode_unavailable",
            AppError::AlreadyActive => "already_active",
            AppError::NoneActive => "none_active",
            AppError::LockHeld { .. } => "lock_held",
            AppError::AlreadyLocked { .. } => "already_locked",
            AppError::NoLock => "no_lock",
            AppError::NotOwner { .. } => "not_owner",
            AppError::OperationInProgress => "operation_in_progress",
            AppError::Timeout(_) => "timeout",
            AppError::FailedRequest(_) => "failed_request",
            AppError::BadRequest(_) => "bad_request",
            AppError::Config(_) => "config",
            AppError::Internal(_) | AppError::Serialization(_) => "internal",
            AppError::Io(_) => "io",
            AppError::DBus(_) => "dbus",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ModeUnavailable => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::AlreadyActive
            | AppError::NoneActive
            | AppError::AlreadyLocked { .. }
            | AppError::NoLock
            | AppError::OperationInProgress => StatusCode::CONFLICT,
            AppError::LockHeld { .. } | AppError::NotOwner { .. } => StatusCode::FORBIDDEN,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::FailedRequest(_) | AppError::DBus(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_)
            | AppError::Internal(_)
            | AppError::Io(_)
            | AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            kind: self.kind(),
            message: self.to_string(),
        };

        tracing::error!(
            error_kind = body.kind,
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_errors_name_the_owner() {
        let err = AppError::LockHeld {
            owner: "clientA".to_string(),
        };
        assert!(err.to_string().contains("clientA"));
        assert_eq!(err.kind(), "lock_held");

        let err = AppError::NotOwner {
            caller: "clientB".to_string(),
            owner: "clientA".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("clientB"));
        assert!(message.contains("Only clientA"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::Timeout("x".into()).into_response().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AppError::AlreadyActive.into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}

/// Daemon error type: wraps `core` errors and maps every variant to an HTTP
/// status, replacing the teacher's `to_rpc_error()`/`code()` JSON-RPC
/// mapping with an `axum::response::IntoResponse` impl.
use agentd_core::{ControllerError, StoreError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ControllerError> for DaemonError {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::Validation(msg) => DaemonError::Validation(msg),
            ControllerError::Forbidden(msg) => DaemonError::Forbidden(msg),
            ControllerError::NotFound(msg) => DaemonError::NotFound(msg),
            ControllerError::ConflictingState { current, required } => DaemonError::Conflict(
                format!("agent is {current}, operation requires {required}"),
            ),
            ControllerError::ResourceExhausted(msg) => DaemonError::ResourceExhausted(msg),
            ControllerError::StartupTimeout => {
                DaemonError::Internal("agent startup timed out".to_string())
            }
            ControllerError::Store(store_err) => DaemonError::from(store_err),
            ControllerError::Supervisor(e) => DaemonError::Internal(e.to_string()),
            ControllerError::Internal(msg) => DaemonError::Internal(msg),
        }
    }
}

impl From<StoreError> for DaemonError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AgentNotFound(id) => DaemonError::NotFound(format!("agent {id}")),
            StoreError::TemplateNotFound(id) => DaemonError::NotFound(format!("template {id}")),
            StoreError::UserNotFound(id) => DaemonError::NotFound(format!("user {id}")),
            StoreError::DuplicateName(name) => {
                DaemonError::Conflict(format!("name '{name}' already in use"))
            }
            StoreError::DuplicateProcessId | StoreError::DuplicatePort(_) => {
                DaemonError::Conflict(e.to_string())
            }
            StoreError::ConflictingState { expected } => {
                DaemonError::Conflict(format!("expected status {expected}"))
            }
            StoreError::InvariantViolation(msg) => DaemonError::Internal(msg),
            StoreError::Database(e) => DaemonError::Internal(e.to_string()),
            StoreError::Serialization(e) => DaemonError::Internal(e.to_string()),
        }
    }
}

impl DaemonError {
    fn status_code(&self) -> StatusCode {
        match self {
            DaemonError::Validation(_) => StatusCode::BAD_REQUEST,
            DaemonError::AuthRequired | DaemonError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            DaemonError::Forbidden(_) => StatusCode::FORBIDDEN,
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::Conflict(_) => StatusCode::CONFLICT,
            DaemonError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::Config(_)
            | DaemonError::Internal(_)
            | DaemonError::Io(_)
            | DaemonError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        assert_eq!(
            DaemonError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(
            DaemonError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}

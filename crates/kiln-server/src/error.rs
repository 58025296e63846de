//! Error types for the kiln server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use kiln_core::KilnError;
use serde_json::json;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job exists but cannot take this operation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No sandbox backend behind this server
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Json(_) => StatusCode::BAD_REQUEST,
            ServerError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Io(_) | ServerError::Config(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::JobNotFound(_) => "job_not_found",
            ServerError::Conflict(_) => "conflict",
            ServerError::Unavailable(_) => "sandbox_unavailable",
            ServerError::Json(_) => "json_error",
            ServerError::Io(_) => "io_error",
            ServerError::Config(_) => "config_error",
            ServerError::Internal(_) => "internal_error",
        }
    }
}

impl From<KilnError> for ServerError {
    fn from(err: KilnError) -> Self {
        match err {
            KilnError::JobNotFound(id) => ServerError::JobNotFound(id),
            KilnError::InvalidInput(msg) => ServerError::InvalidRequest(msg),
            KilnError::InvalidJobState { job_id, reason } => {
                ServerError::Conflict(format!("job {}: {}", job_id, reason))
            }
            KilnError::SandboxUnavailable(msg) => ServerError::Unavailable(msg),
            KilnError::Config(msg) => ServerError::Config(msg),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        } else {
            log::debug!("Request rejected: {}", self);
        }

        let body = Json(json!({
            "error": self.to_string(),
            "error_type": self.error_type(),
            "timestamp": chrono::Utc::now()
        }));
        (status, body).into_response()
    }
}

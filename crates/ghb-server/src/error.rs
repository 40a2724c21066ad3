//! Error types for the HTTP façade.

use axum::{
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Body returned to clients for internal failures.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";

/// Errors raised while constructing a [`Server`](crate::Server) or loading
/// its configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("repository owner is required")]
    OwnerMissing,
    #[error("repository name is required")]
    RepoNameMissing,
    #[error("store has no HEAD reference")]
    HeadMissing,
    #[error("storage error: {0}")]
    Storage(#[from] ghb_storage::StorageError),
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Errors surfaced by the smart HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid content type, expected {expected}")]
    InvalidContentType { expected: &'static str },
    #[error("service not allowed: {0:?}")]
    Forbidden(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("git error: {0}")]
    Git(#[from] ghb_git::GitError),
    #[error("storage error: {0}")]
    Storage(#[from] ghb_storage::StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// The status code this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed(_) | Self::BadRequest(_) | Self::InvalidContentType { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Git(_) | Self::Storage(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            INTERNAL_ERROR_MESSAGE.to_string()
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
            self.to_string()
        };

        let body = Json(ErrorResponse { error: message });
        match self {
            Self::Unauthorized => (
                status,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"ghb\"")],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

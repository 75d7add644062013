//! Error types for Pubgate
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Each variant maps to one HTTP status. Federation failures toward remote
/// hosts are usually logged and swallowed by callers rather than returned.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// No keypair has been generated for this actor (404)
    #[error("No keypair on file for actor {0}")]
    KeyNotFound(String),

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Inbound activity envelope could not be decoded (401)
    #[error("Invalid activity envelope: {0}")]
    InvalidEnvelope(String),

    /// Signature verification failed (401)
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// HTTP status and metric label for this error.
    pub fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            AppError::KeyNotFound(_) => (StatusCode::NOT_FOUND, "key_not_found"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            AppError::InvalidEnvelope(_) => (StatusCode::UNAUTHORIZED, "invalid_envelope"),
            AppError::InvalidSignature(_) => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database"),
            AppError::Federation(_) => (StatusCode::BAD_GATEWAY, "federation"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Server-side failures get a generic body; the detail only goes to the log.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_type) = self.status_and_kind();

        let error_message = match &self {
            AppError::Validation(msg) => msg.clone(),
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                tracing::error!(error = %self, "Request failed with server error");
                "Internal server error".to_string()
            }
            AppError::InvalidSignature(_) | AppError::InvalidEnvelope(_) => {
                tracing::warn!(error = %self, "Rejected unauthenticated activity");
                self.to_string()
            }
            _ => self.to_string(),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[error_type])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

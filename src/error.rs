//! Error types for fedispatch
//!
//! Dispatch-level failures are `AppError`. Problems with a single audience
//! entry are `AudienceError`; those are collected and reported alongside a
//! resolution instead of aborting it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// host-meta or lrdd lookup failed (502)
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Client registration with a remote server failed (502)
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Inbox POST was rejected or never reached the server (502)
    #[error("Delivery failed: {message}")]
    Delivery {
        status: Option<u16>,
        message: String,
    },

    /// Job could not be queued (503)
    #[error("Queue error: {0}")]
    Queue(String),

    /// Dialback or OAuth signature did not verify (401)
    #[error("Invalid signature")]
    InvalidSignature,

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
    /// Short label used for the `errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::Discovery(_) => "discovery",
            AppError::Registration(_) => "registration",
            AppError::Delivery { .. } => "delivery",
            AppError::Queue(_) => "queue",
            AppError::InvalidSignature => "invalid_signature",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether a failed job may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AppError::NotFound
                | AppError::Validation(_)
                | AppError::InvalidSignature
                | AppError::Config(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::Json;

        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidSignature => StatusCode::UNAUTHORIZED,
            AppError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::HttpClient(_)
            | AppError::Discovery(_)
            | AppError::Registration(_)
            | AppError::Delivery { .. } => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Never leak store or internal details to peers.
        let message = match &self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind(), "http"])
            .inc();

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// A problem with one raw audience entry.
///
/// Reported next to the resolved identity set; never aborts resolution of the
/// remaining entries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudienceError {
    #[error("'objectType' property is missing from audience")]
    MissingType,

    #[error("Audience type '{0}' is not known")]
    UnknownType(String),

    #[error("User '{0}' is not known")]
    UnknownLocalUser(String),

    /// Raw `collection` audience objects are recognised but not expanded.
    #[error("Collection audiences are not supported")]
    UnsupportedCollection,

    #[error("Invalid account handle: {0}")]
    InvalidHandle(String),

    #[error("Unresolvable audience entry: {0}")]
    Unresolvable(String),

    #[error("Failed to load audience: {0}")]
    Store(String),
}

impl From<AppError> for AudienceError {
    fn from(err: AppError) -> Self {
        AudienceError::Store(err.to_string())
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure of a single `send_reply` call anywhere in the messenger chain.
#[derive(Debug, Error)]
pub enum SendError {
    /// Network failure, 5xx or 429 after the retry budget was spent.
    #[error("{provider} transient failure: {message}")]
    Transient {
        provider: &'static str,
        message: String,
    },
    /// Any other 4xx. Never retried.
    #[error("{provider} rejected message ({status}): {message}")]
    Permanent {
        provider: &'static str,
        status: u16,
        message: String,
    },
    #[error("sms provider not configured: {0}")]
    NotConfigured(String),
    #[error("invalid reply: {0}")]
    Invalid(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient { .. })
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Authentication(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotConfigured(String),
    #[error("{0}")]
    Publish(String),
    #[error("{0}")]
    Internal(String),
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::Validation(_) => StatusCode::BAD_REQUEST,
            WebhookError::Authentication(_) => StatusCode::UNAUTHORIZED,
            WebhookError::NotFound(_) => StatusCode::NOT_FOUND,
            WebhookError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::Publish(_) | WebhookError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({"error": self.to_string()}))).into_response()
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown destination number {0}")]
    UnknownNumber(String),
    #[error("org lookup failed: {0}")]
    Lookup(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("invalid clock value {0:?}, expected HH:MM")]
    InvalidClock(String),
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
}

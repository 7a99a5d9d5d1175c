use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = AdmissionError> = std::result::Result<T, E>;

/// Failures raised by a [`BucketStore`](crate::store::BucketStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store operation timed out after {0}ms")]
    Timeout(u64),

    #[error("corrupt bucket record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Connection(err.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("bucket store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl From<validator::ValidationErrors> for AdmissionError {
    fn from(err: validator::ValidationErrors) -> Self {
        AdmissionError::Validation(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_admission_error(err: &AdmissionError) -> Self {
        let message = err.to_string();
        match err {
            AdmissionError::InvalidPolicy(_) => Self::new("invalid_policy", &message, 500),
            AdmissionError::InvalidKey(_) => Self::new("bad_request", &message, 400),
            AdmissionError::UnknownPolicy(_) => Self::new("not_found", &message, 404),
            AdmissionError::StoreUnavailable(_) => Self::new("service_unavailable", &message, 503),
            AdmissionError::Unauthorized(_) => Self::new("unauthorized", &message, 401),
            AdmissionError::Configuration(_) => Self::new("configuration_error", &message, 500),
            AdmissionError::Validation(_) => Self::new("validation_error", &message, 422),
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_admission_error(&self);
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

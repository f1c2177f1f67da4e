//! Server error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hearth_core::CoreError;

/// Server error types mapped to HTTP status codes.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    /// Backing store down after retry; the device should back off and retry.
    StorageUnavailable(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(e) => write!(f, "Bad request: {}", e),
            Self::Unauthorized(e) => write!(f, "Unauthorized: {}", e),
            Self::Forbidden(e) => write!(f, "Forbidden: {}", e),
            Self::NotFound(e) => write!(f, "Not found: {}", e),
            Self::StorageUnavailable(e) => write!(f, "Storage unavailable: {}", e),
            Self::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(e) => (StatusCode::BAD_REQUEST, e.clone()),
            Self::Unauthorized(e) => (StatusCode::UNAUTHORIZED, e.clone()),
            Self::Forbidden(e) => (StatusCode::FORBIDDEN, e.clone()),
            Self::NotFound(e) => (StatusCode::NOT_FOUND, e.clone()),
            Self::StorageUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Storage unavailable".to_string(),
            ),
            Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Storage(msg) => Self::StorageUnavailable(msg),
            CoreError::InvalidKey(msg) => Self::BadRequest(msg),
            CoreError::UnknownSerial(serial) => Self::Forbidden(serial),
            other => Self::Internal(other.to_string()),
        }
    }
}

use crate::services::image_repository::ImageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    /// Stable machine-readable kind, e.g. `invalid_content_type`.
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = self.code, status = %self.status, "{}", self.message);
        }

        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ImageError> for AppError {
    fn from(err: ImageError) -> Self {
        let (status, code) = match &err {
            ImageError::InvalidContentType { .. } => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "invalid_content_type")
            }
            ImageError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ImageError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ImageError::StorageUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable")
            }
            ImageError::PartialUpdateFailure { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "partial_update_failure")
            }
            ImageError::Storage { .. } => (StatusCode::BAD_GATEWAY, "storage_error"),
            ImageError::Cancelled { .. } => (StatusCode::GATEWAY_TIMEOUT, "cancelled"),
        };
        AppError::new(status, code, err.to_string())
    }
}

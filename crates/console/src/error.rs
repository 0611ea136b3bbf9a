use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mempool_common::MempoolError;
use serde::Serialize;

/// JSON error body returned by console endpoints.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    reason: String,
}

/// An error that renders as `{"code", "message", "reason"}` with the given status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub reason: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            reason: String::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

impl From<MempoolError> for ApiError {
    fn from(err: MempoolError) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, message = %self.message, "request failed");
        }

        let body = ErrorBody {
            code: self
                .status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            message: self.message,
            reason: self.reason,
        };
        (self.status, Json(body)).into_response()
    }
}

//! API error types and JSON error response formatting.
//!
//! Every failure leaves the server as `{error, message}` with a status code
//! chosen by who is at fault: the caller (4xx) or the session store (503).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use prodlens_chat::ChatError;

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid input.
    #[error("{0}")]
    BadRequest(String),
    /// 404 Not Found - no such route or resource.
    #[error("{0}")]
    NotFound(String),
    /// 500 Internal Server Error.
    #[error("{0}")]
    Internal(String),
    /// 503 Service Unavailable - the session store cannot be reached.
    #[error("{0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal_error",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::SessionStore(_) => {
                ApiError::ServiceUnavailable("conversation storage is unavailable".to_string())
            }
            caller => ApiError::BadRequest(caller.to_string()),
        }
    }
}

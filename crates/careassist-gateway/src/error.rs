use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use careassist_common::Error;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors surfaced by the HTTP layer.
///
/// Every variant renders as `{"status": "error", "code": ..., "message": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Domain(#[from] Error),

    #[error("{0}")]
    Unauthorized(String),

    #[error("a request with this Idempotency-Key is still in progress")]
    RequestInProgress,

    #[error("the request did not finish in time; retry with the same Idempotency-Key")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Domain(Error::Validation(message.into()))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Domain(err) => match err {
                Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                Error::NotFound(_) => StatusCode::NOT_FOUND,
                Error::Forbidden(_) => StatusCode::FORBIDDEN,
                Error::BudgetExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
                Error::Provider(_) => StatusCode::BAD_GATEWAY,
                Error::Database(_)
                | Error::Config(_)
                | Error::Serialization(_)
                | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RequestInProgress => StatusCode::CONFLICT,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Domain(err) => match err {
                Error::Validation(_) => "validation_error",
                Error::NotFound(_) => "not_found",
                Error::Forbidden(_) => "forbidden",
                Error::BudgetExceeded(_) => "budget_exceeded",
                Error::Provider(p) => p.code(),
                Error::Database(_) => "persistence_error",
                Error::Config(_) | Error::Serialization(_) | Error::Io(_) => "internal_error",
            },
            Self::Unauthorized(_) => "unauthorized",
            Self::RequestInProgress => "request_in_progress",
            Self::Timeout => "request_timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Client-facing message. Server-side failures are logged but not echoed.
    fn public_message(&self) -> String {
        match self {
            Self::Domain(Error::Database(_)) => "failed to persist chat data".to_string(),
            Self::Domain(Error::Config(_) | Error::Serialization(_) | Error::Io(_))
            | Self::Internal(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), "request failed: {self}");
        }
        let body = json!({
            "status": "error",
            "code": self.code(),
            "message": self.public_message(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

//! Error mapping from bus statuses onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use pcas_types::{BusError, ErrorCode};

/// Wrapper giving [`BusError`] an HTTP representation.
#[derive(Debug)]
pub struct ApiError(pub BusError);

/// Result type for handlers.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Machine-readable status code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        Self(err)
    }
}

fn http_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists => StatusCode::CONFLICT,
        ErrorCode::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Canceled => StatusCode::REQUEST_TIMEOUT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = http_status(code);
        let message = self.0.to_string();

        if status.is_server_error() {
            tracing::error!(status = %status, code = %code, error = %message, "Server error");
        } else {
            tracing::warn!(status = %status, code = %code, error = %message, "Client error");
        }

        (status, Json(ErrorResponse { code, message })).into_response()
    }
}

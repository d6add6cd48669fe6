//! Error taxonomy shared across the bus.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the bus error type.
pub type Result<T> = std::result::Result<T, BusError>;

/// Machine-readable status code attached to every error.
///
/// The set is closed: providers and storage map their failures into it, and
/// transports map it onto their own status space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Unauthorized,
    RateLimited,
    Unavailable,
    Timeout,
    Canceled,
    Internal,
}

impl ErrorCode {
    /// Stable string form used in wire payloads and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::FailedPrecondition => "failed_precondition",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Malformed request or empty required field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing event or node.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate subscription or identifier.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation requires capability the target lacks.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Upstream rejected the caller's credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Upstream throttling; callers may retry.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transient transport failure.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Context cancelled by the caller.
    #[error("canceled: {0}")]
    Canceled(String),

    /// Unexpected failure, including serialisation errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BusError {
    /// The status code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::RateLimited(_) => ErrorCode::RateLimited,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Canceled(_) => ErrorCode::Canceled,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::RateLimited(_) | Self::Timeout(_)
        )
    }

    /// Build an error from a code and message, the inverse of [`code`].
    ///
    /// [`code`]: BusError::code
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::InvalidArgument => Self::InvalidArgument(message),
            ErrorCode::NotFound => Self::NotFound(message),
            ErrorCode::AlreadyExists => Self::AlreadyExists(message),
            ErrorCode::FailedPrecondition => Self::FailedPrecondition(message),
            ErrorCode::Unauthorized => Self::Unauthorized(message),
            ErrorCode::RateLimited => Self::RateLimited(message),
            ErrorCode::Unavailable => Self::Unavailable(message),
            ErrorCode::Timeout => Self::Timeout(message),
            ErrorCode::Canceled => Self::Canceled(message),
            ErrorCode::Internal => Self::Internal(message),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Internal(format!("serialization error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(
            BusError::InvalidArgument("x".into()).code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(BusError::NotFound("x".into()).code(), ErrorCode::NotFound);
        assert_eq!(BusError::Internal("x".into()).code(), ErrorCode::Internal);
    }

    #[test]
    fn test_from_code_roundtrip() {
        for code in [
            ErrorCode::InvalidArgument,
            ErrorCode::NotFound,
            ErrorCode::AlreadyExists,
            ErrorCode::FailedPrecondition,
            ErrorCode::Unauthorized,
            ErrorCode::RateLimited,
            ErrorCode::Unavailable,
            ErrorCode::Timeout,
            ErrorCode::Canceled,
            ErrorCode::Internal,
        ] {
            assert_eq!(BusError::from_code(code, "m").code(), code);
        }
    }

    #[test]
    fn test_retryable() {
        assert!(BusError::Unavailable("net".into()).is_retryable());
        assert!(BusError::RateLimited("slow down".into()).is_retryable());
        assert!(!BusError::InvalidArgument("bad".into()).is_retryable());
        assert!(!BusError::Unauthorized("key".into()).is_retryable());
    }

    #[test]
    fn test_code_serde() {
        let code = ErrorCode::FailedPrecondition;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"failed_precondition\"");
        assert_eq!(code.as_str(), "failed_precondition");
    }
}

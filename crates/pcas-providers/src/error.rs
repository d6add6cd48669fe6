//! Error types for provider backends.

use pcas_types::BusError;
use thiserror::Error;

/// Result type alias using the provider error type.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Error type for provider operations.
///
/// The taxonomy is closed: concrete backends classify their transport and
/// API failures into it, and the bus maps it onto the wire status space.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider service is unreachable or down (retryable).
    #[error("provider service is unavailable: {0}")]
    Unavailable(String),

    /// The input handed to the provider is invalid (never retried).
    #[error("invalid input provided to provider: {0}")]
    InvalidInput(String),

    /// The provider operation timed out (retryable).
    #[error("provider operation timed out: {0}")]
    Timeout(String),

    /// The provider is throttling requests.
    #[error("provider rate limit exceeded: {0}")]
    RateLimited(String),

    /// Authentication or authorization failed (never retried).
    #[error("provider authentication failed: {0}")]
    Unauthorized(String),

    /// Unexpected provider failure.
    #[error("provider internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Only transport-layer failures are retryable; invalid input and
    /// authentication failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() {
            ProviderError::Unavailable(format!("connection failed: {err}"))
        } else if err.is_decode() {
            ProviderError::Internal(format!("failed to decode response: {err}"))
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

impl From<ProviderError> for BusError {
    fn from(err: ProviderError) -> Self {
        let message = err.to_string();
        match err {
            ProviderError::Unavailable(_) => BusError::Unavailable(message),
            ProviderError::InvalidInput(_) => BusError::InvalidArgument(message),
            ProviderError::Timeout(_) => BusError::Timeout(message),
            ProviderError::RateLimited(_) => BusError::RateLimited(message),
            ProviderError::Unauthorized(_) => BusError::Unauthorized(message),
            ProviderError::Internal(_) => BusError::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Unavailable("down".into()).is_retryable());
        assert!(ProviderError::Timeout("slow".into()).is_retryable());
        assert!(!ProviderError::RateLimited("429".into()).is_retryable());
        assert!(!ProviderError::InvalidInput("bad".into()).is_retryable());
        assert!(!ProviderError::Unauthorized("key".into()).is_retryable());
        assert!(!ProviderError::Internal("boom".into()).is_retryable());
    }

    #[test]
    fn test_bus_error_mapping() {
        use pcas_types::ErrorCode;

        let cases = [
            (
                ProviderError::Unavailable("x".into()),
                ErrorCode::Unavailable,
            ),
            (
                ProviderError::InvalidInput("x".into()),
                ErrorCode::InvalidArgument,
            ),
            (ProviderError::Timeout("x".into()), ErrorCode::Timeout),
            (
                ProviderError::RateLimited("x".into()),
                ErrorCode::RateLimited,
            ),
            (
                ProviderError::Unauthorized("x".into()),
                ErrorCode::Unauthorized,
            ),
            (ProviderError::Internal("x".into()), ErrorCode::Internal),
        ];
        for (err, code) in cases {
            assert_eq!(BusError::from(err).code(), code);
        }
    }
}

//! Error types for the Turnstile limiter.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Malformed configuration, rule string or storage URI. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared counter store could not be reached and the configured
    /// failure mode does not allow the request through.
    #[error("Rate limit storage unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised by a counter store.
///
/// Every variant means the store could not answer; callers must not read it
/// as either an approval or a denial.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection refused, protocol error or malformed reply.
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured bound.
    #[error("store timed out after {0:?}")]
    Timeout(Duration),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_into_turnstile_error() {
        let err: TurnstileError = StoreError::Timeout(Duration::from_millis(250)).into();
        assert!(matches!(err, TurnstileError::StoreUnavailable(StoreError::Timeout(_))));
        assert_eq!(
            err.to_string(),
            "Rate limit storage unavailable: store timed out after 250ms"
        );
    }
}

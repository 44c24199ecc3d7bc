//! Error types for the Sliding Gate rate limiter.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while talking to the shared window backend.
///
/// These never reach the caller of [`crate::ratelimit::LimiterFacade`]; the facade
/// absorbs them according to its failure policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached (connection refused, reset, closed)
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend round trip exceeded the configured deadline
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered, but not in the shape the batch expected
    #[error("unexpected backend reply: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Classify a Redis client error. Client-side timeouts are reported as
    /// [`BackendError::Timeout`] carrying `deadline`, the bound the caller
    /// configured for the round trip.
    pub fn from_redis(err: redis::RedisError, deadline: Duration) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(deadline)
        } else if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_unrecoverable_error()
        {
            BackendError::Unavailable(err.to_string())
        } else {
            BackendError::Protocol(err.to_string())
        }
    }
}

/// Main error type for Sliding Gate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend errors surfaced outside the facade (e.g. while connecting)
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Sliding Gate operations.
pub type Result<T> = std::result::Result<T, GateError>;

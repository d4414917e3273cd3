//! Error types for Fluxguard.

use thiserror::Error;

/// Main error type for Fluxguard operations.
///
/// Admission rejections are never errors: a limiter that refuses a request
/// returns `Ok(false)`. Errors here mean the decision itself could not be made.
#[derive(Error, Debug)]
pub enum FluxError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration source could not be read or merged
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Storage errors that are not tied to a specific backend
    #[error("Storage error: {0}")]
    Storage(String),

    /// Numeric operation attempted on a non-numeric value
    #[error("Value stored at '{key}' is not numeric")]
    NotNumeric { key: String },

    /// Remote store errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Fluxguard operations.
pub type Result<T> = std::result::Result<T, FluxError>;

/// Error returned by a call wrapped in a [`CircuitBreaker`](crate::breaker::CircuitBreaker).
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// The breaker is open; the wrapped function was not invoked.
    #[error("Circuit breaker is open")]
    Open,

    /// The wrapped function ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns `true` if the call was rejected without being invoked.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }

    /// Returns the wrapped error, if the call was invoked.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Open => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}

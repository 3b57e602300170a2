//! Error types for the resilience runtime itself.
//!
//! Failures coming from caller operations are *data* and travel as
//! [`ClassifiedError`](crate::classifier::ClassifiedError) inside a
//! [`RecoveryOutcome`](crate::recovery::RecoveryOutcome). [`ResilienceError`]
//! only covers problems raised by this crate's own machinery.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Unified error type for configuration, admission, and lifecycle failures.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// Invalid or missing configuration (bad retry policy, unreadable file, etc.).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The rate limiter denied an operation.
    #[error("Rate limit exceeded for {operation}")]
    RateLimited {
        /// Operation type that was throttled.
        operation: String,
        /// How long the caller should wait before trying again, when known.
        retry_after: Option<Duration>,
    },

    /// A recovery was cancelled before it completed.
    #[error("Cancelled")]
    Cancelled,

    /// A recovery exceeded the manager's global timeout.
    #[error("Timeout")]
    Timeout,

    /// Recovery was attempted and could not restore the operation.
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),
}

impl ResilienceError {
    /// Returns `true` for [`RateLimited`](Self::RateLimited) and
    /// [`Timeout`](Self::Timeout), which may succeed if attempted later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Timeout)
    }

    /// The wait hint carried by a [`RateLimited`](Self::RateLimited) error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

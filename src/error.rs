//! Error types for the Turnstile service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Admission denials and CSRF rejections are not errors; they are reported
/// through [`crate::gate::Admission`].
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The external rate limit backend answered with something unusable.
    #[error("Rate limit backend error: {0}")]
    Backend(String),

    /// The external rate limit backend did not answer within its deadline.
    #[error("Rate limit backend timed out after {0:?}")]
    BackendTimeout(Duration),

    /// Transport errors talking to the external backend
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error means the rate limit backend could not give a decision.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(
            self,
            TurnstileError::Backend(_) | TurnstileError::BackendTimeout(_) | TurnstileError::Http(_)
        )
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

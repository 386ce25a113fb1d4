//! Rate limit budgets and decisions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Budget for one protected route: at most `max_requests` per `window_ms`.
///
/// Both values are validated to be positive on construction, and the window
/// must fit in the signed millisecond timestamps used for window arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    max_requests: u64,
    window_ms: u64,
}

#[derive(Deserialize)]
struct RawRateLimitConfig {
    max_requests: u64,
    window_ms: u64,
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = TurnstileError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self> {
        Self::new(raw.max_requests, raw.window_ms)
    }
}

impl RateLimitConfig {
    /// Create a new budget.
    ///
    /// Returns a configuration error if either value is zero or the window
    /// does not fit in an `i64`.
    pub fn new(max_requests: u64, window_ms: u64) -> Result<Self> {
        if max_requests == 0 {
            return Err(TurnstileError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if window_ms == 0 {
            return Err(TurnstileError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if i64::try_from(window_ms).is_err() {
            return Err(TurnstileError::Config(format!(
                "window_ms must be at most {}",
                i64::MAX
            )));
        }
        Ok(Self {
            max_requests,
            window_ms,
        })
    }

    /// Maximum number of admitted requests per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Window length as signed milliseconds, for arithmetic on timestamps.
    pub fn window_millis(&self) -> i64 {
        // Bounded by `new`.
        self.window_ms as i64
    }

    /// Window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Outcome of a single rate limit check.
///
/// `reset` is an absolute timestamp in milliseconds since the Unix epoch,
/// regardless of which backend produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request is within budget
    pub success: bool,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends (epoch millis)
    pub reset: i64,
}

impl RateLimitResult {
    /// An admitted request.
    pub fn allowed(remaining: u64, reset: i64) -> Self {
        Self {
            success: true,
            remaining,
            reset,
        }
    }

    /// A denied request. Remaining is always zero.
    pub fn denied(reset: i64) -> Self {
        Self {
            success: false,
            remaining: 0,
            reset,
        }
    }
}

//! Fixed-window counter state.
//!
//! A window opens on the first request seen for a key and stays fixed for
//! `window_ms`. Every request before `reset_at` shares one counter. This lets
//! a client send up to twice the budget across a window boundary (the tail of
//! one window plus the head of the next); in exchange each key costs O(1)
//! memory and O(1) work per request.

use super::policy::{RateLimitConfig, RateLimitResult};

/// Request count for one key in its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Admitted requests in this window
    pub count: u64,
    /// End of this window (epoch millis)
    pub reset_at: i64,
}

impl CounterEntry {
    /// Open a new window at `now` holding one admitted request.
    pub fn open(now: i64, config: &RateLimitConfig) -> Self {
        Self {
            count: 1,
            reset_at: now.saturating_add(config.window_millis()),
        }
    }

    /// A window is over once the clock has passed `reset_at`.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.reset_at
    }

    /// Apply one request to a live window.
    ///
    /// Denied requests leave the entry untouched.
    pub fn admit(&mut self, config: &RateLimitConfig) -> RateLimitResult {
        if self.count >= config.max_requests() {
            return RateLimitResult::denied(self.reset_at);
        }
        self.count += 1;
        RateLimitResult::allowed(config.max_requests() - self.count, self.reset_at)
    }

    /// Result describing a freshly opened window.
    pub fn opened_result(&self, config: &RateLimitConfig) -> RateLimitResult {
        RateLimitResult::allowed(config.max_requests() - self.count, self.reset_at)
    }
}

//! Wall-clock sources for window arithmetic.
//!
//! Windows are tracked in milliseconds since the Unix epoch so that reset
//! timestamps can be handed straight to clients.

use std::fmt::Debug;

use parking_lot::Mutex;

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// System clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<i64>,
}

impl ManualClock {
    /// Create a clock frozen at `start` epoch millis.
    pub fn new(start: i64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, millis: i64) {
        *self.now.lock() += millis;
    }

    /// Jump to an absolute time.
    pub fn set(&self, millis: i64) {
        *self.now.lock() = millis;
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        *self.now.lock()
    }
}

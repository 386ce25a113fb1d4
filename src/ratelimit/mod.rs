//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod limiter;
mod policy;
mod rules;
mod upstash;

pub use backend::{build_backend, RateLimiterBackend, SelectedBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::CounterEntry;
pub use limiter::{InMemoryRateLimiter, DEFAULT_MAX_ENTRIES};
pub use policy::{RateLimitConfig, RateLimitResult};
pub use rules::{FailurePolicy, RouteRule, RouteRules};
pub use upstash::UpstashRateLimiter;

//! Admission gate: decides whether a request reaches business logic.
//!
//! # Data Flow
//! ```text
//! Incoming request
//!     → csrf.rs (mutating routes only; reject before touching any counter)
//!     → identity (client key + ":" + route tag)
//!     → RateLimiterBackend::check
//!     → Admission (allowed / limited / forbidden) → response.rs
//! ```

mod csrf;
pub mod middleware;
mod response;

use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;
use tracing::{debug, trace, warn};

pub use csrf::{CsrfGuard, CSRF_HEADER};
pub use response::{
    apply_quota_headers, BYPASS_HEADER, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET,
};

use crate::config::TurnstileConfig;
use crate::error::Result;
use crate::identity::ClientIdentityResolver;
use crate::ratelimit::{Clock, RateLimitResult, RateLimiterBackend, RouteRule, SystemClock};
use response::retry_after_secs;

/// Budget metadata attached to every rate-limited outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    /// Configured budget per window
    pub limit: u64,
    /// Requests left after this decision
    pub remaining: u64,
    /// Window end (epoch millis)
    pub reset: i64,
}

impl Quota {
    fn from_result(limit: u64, result: &RateLimitResult) -> Self {
        Self {
            limit,
            remaining: result.remaining,
            reset: result.reset,
        }
    }
}

/// Outcome of running a request through the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Request may proceed
    Allowed(Quota),
    /// Budget exhausted for this window; `remaining` is zero
    Limited {
        quota: Quota,
        /// Whole seconds until the window ends, at least one
        retry_after: u64,
    },
    /// Mutating request without the right shared secret
    Forbidden,
}

impl Admission {
    /// Whether the request may proceed to the handler.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }
}

/// Orchestrates CSRF checking, identity resolution and the rate limit check.
///
/// The backend is chosen once at startup; the gate only sees the trait.
#[derive(Clone)]
pub struct AdmissionGate {
    backend: Arc<dyn RateLimiterBackend>,
    resolver: ClientIdentityResolver,
    csrf: CsrfGuard,
    /// Used for `Retry-After`; should match the backend's clock
    clock: Arc<dyn Clock>,
}

impl AdmissionGate {
    /// Create a gate over an already constructed backend.
    pub fn new(
        backend: Arc<dyn RateLimiterBackend>,
        resolver: ClientIdentityResolver,
        csrf: CsrfGuard,
    ) -> Self {
        Self {
            backend,
            resolver,
            csrf,
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Replace the clock used to compute `Retry-After`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create a gate from validated configuration and a backend.
    pub fn from_config(config: &TurnstileConfig, backend: Arc<dyn RateLimiterBackend>) -> Self {
        Self::new(
            backend,
            ClientIdentityResolver::new(config.trust_proxy_headers),
            CsrfGuard::from_config(&config.csrf),
        )
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Run a request with the given headers through the gate for `route`.
    ///
    /// # Errors
    /// Only backend failures are errors. Whether to admit or reject in that
    /// case is the caller's decision, see [`crate::ratelimit::FailurePolicy`].
    pub async fn admit(&self, headers: &HeaderMap, route: &RouteRule) -> Result<Admission> {
        if route.mutating && !self.csrf.verify(headers) {
            warn!(route = %route.tag, "Rejected request with invalid CSRF token");
            return Ok(Admission::Forbidden);
        }

        let identifier = self.resolver.key_for(headers, &route.tag);
        let result = self.backend.check(&identifier, &route.limit).await?;
        let quota = Quota::from_result(route.limit.max_requests(), &result);

        if result.success {
            trace!(
                identifier = %identifier,
                remaining = quota.remaining,
                "Request admitted"
            );
            Ok(Admission::Allowed(quota))
        } else {
            debug!(
                identifier = %identifier,
                backend = self.backend.name(),
                reset = quota.reset,
                "Request rate limited"
            );
            Ok(Admission::Limited {
                quota: Quota {
                    remaining: 0,
                    ..quota
                },
                retry_after: retry_after_secs(quota.reset, self.clock.now_millis()),
            })
        }
    }
}

//! Rate limiter trait for abstracting local and external implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::clock::SystemClock;
use super::limiter::InMemoryRateLimiter;
use super::policy::{RateLimitConfig, RateLimitResult};
use super::upstash::UpstashRateLimiter;
use crate::config::{RateLimitMode, RateLimitingConfig};
use crate::error::{Result, TurnstileError};

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the in-process [`InMemoryRateLimiter`] and the
/// [`UpstashRateLimiter`] so the admission gate can work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request against `identifier` under `config`.
    ///
    /// Returns an error only when no decision could be obtained. A denial is
    /// an `Ok` result with `success == false`.
    async fn check(&self, identifier: &str, config: &RateLimitConfig) -> Result<RateLimitResult>;

    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;
}

/// A constructed backend together with the in-process store, if that is the
/// selected one, so the caller can run its sweeper.
pub struct SelectedBackend {
    pub backend: Arc<dyn RateLimiterBackend>,
    pub in_memory: Option<Arc<InMemoryRateLimiter>>,
}

/// Build the backend selected by configuration.
///
/// Called once at startup. For the external backend this performs the
/// connection handshake, so unreachable or misconfigured backends fail here.
pub async fn build_backend(config: &RateLimitingConfig) -> Result<SelectedBackend> {
    match config.mode {
        RateLimitMode::Inmem => {
            let limiter = Arc::new(InMemoryRateLimiter::with_capacity(
                Arc::new(SystemClock::new()),
                config.max_entries,
            ));
            info!(max_entries = config.max_entries, "Using in-process rate limiter");
            Ok(SelectedBackend {
                backend: limiter.clone(),
                in_memory: Some(limiter),
            })
        }
        RateLimitMode::Upstash => {
            let upstash = config.upstash.as_ref().ok_or_else(|| {
                TurnstileError::Config(
                    "RATE_LIMIT_MODE=UPSTASH requires Upstash credentials".to_string(),
                )
            })?;
            let limiter = UpstashRateLimiter::connect(
                &upstash.rest_url,
                &upstash.rest_token,
                Duration::from_millis(upstash.timeout_ms),
                &upstash.key_prefix,
            )
            .await?;
            info!(url = %upstash.rest_url, "Using Upstash rate limiter");
            Ok(SelectedBackend {
                backend: Arc::new(limiter),
                in_memory: None,
            })
        }
    }
}

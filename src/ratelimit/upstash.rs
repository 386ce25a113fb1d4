//! Rate limiter backed by Upstash Redis over its REST API.
//!
//! Multiple Turnstile instances pointed at the same database share one
//! global counter per identifier. The decision is taken server-side by a Lua
//! script so that concurrent instances cannot race each other.
//!
//! ## Algorithm
//!
//! Sliding window approximated from two fixed windows, as Upstash's own
//! ratelimit SDK does: the count of the previous window is weighted by how
//! much of it still overlaps the sliding window and added to the count of the
//! current one. Keys are `{prefix}:{identifier}:{window_index}` and expire
//! after two windows.
//!
//! ## Failure model
//!
//! Every call carries a deadline. Transport failures, non-success statuses,
//! error payloads and timeouts are all returned as errors; this adapter never
//! decides on its own to admit or reject when Redis cannot answer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, trace};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::policy::{RateLimitConfig, RateLimitResult};
use crate::error::{Result, TurnstileError};

/// Returns `{remaining, ms_until_reset}`; `remaining == -1` means denied.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local current_key = KEYS[1]
local previous_key = KEYS[2]
local tokens = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])

local requests_in_current = tonumber(redis.call("GET", current_key) or "0")
local requests_in_previous = tonumber(redis.call("GET", previous_key) or "0")
local elapsed = now % window
local weighted_previous = math.floor((1 - elapsed / window) * requests_in_previous)

if weighted_previous + requests_in_current >= tokens then
  return {-1, window - elapsed}
end

local new_value = redis.call("INCR", current_key)
if new_value == 1 then
  redis.call("PEXPIRE", current_key, window * 2 + 1000)
end
return {tokens - (new_value + weighted_previous), window - elapsed}
"#;

/// Body of an Upstash REST reply.
#[derive(Debug, Deserialize)]
struct UpstashReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Rate limiter that delegates every decision to Upstash Redis.
///
/// Build it once with [`UpstashRateLimiter::connect`] and share it; the
/// underlying HTTP client keeps its connection pool across calls.
pub struct UpstashRateLimiter {
    client: Client,
    url: String,
    token: String,
    timeout: Duration,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for UpstashRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstashRateLimiter")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl UpstashRateLimiter {
    /// Create the limiter and verify the database answers `PING`.
    ///
    /// # Errors
    /// Returns an error if the credentials are empty, the client cannot be
    /// built, or the handshake fails or times out.
    pub async fn connect(url: &str, token: &str, timeout: Duration, key_prefix: &str) -> Result<Self> {
        let limiter = Self::new(url, token, timeout, key_prefix)?;
        limiter.ping().await?;
        debug!(url = %limiter.url, "Connected to Upstash");
        Ok(limiter)
    }

    /// Create the limiter without contacting the database.
    pub fn new(url: &str, token: &str, timeout: Duration, key_prefix: &str) -> Result<Self> {
        if url.trim().is_empty() || token.trim().is_empty() {
            return Err(TurnstileError::Config(
                "Upstash REST URL and token must both be set".to_string(),
            ));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            timeout,
            key_prefix: key_prefix.to_string(),
            clock: Arc::new(SystemClock::new()),
        })
    }

    /// Replace the clock used for window arithmetic.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Round trip a `PING`.
    pub async fn ping(&self) -> Result<()> {
        match self.command(json!(["PING"])).await? {
            Value::String(pong) if pong.eq_ignore_ascii_case("PONG") => Ok(()),
            other => Err(TurnstileError::Backend(format!(
                "unexpected PING reply: {}",
                other
            ))),
        }
    }

    fn window_key(&self, identifier: &str, window_index: i64) -> String {
        format!("{}:{}:{}", self.key_prefix, identifier, window_index)
    }

    /// Send one command, bounded by the configured deadline.
    async fn command(&self, body: Value) -> Result<Value> {
        match tokio::time::timeout(self.timeout, self.send(body)).await {
            Ok(result) => result,
            Err(_) => {
                error!(url = %self.url, timeout = ?self.timeout, "Upstash request timed out");
                Err(TurnstileError::BackendTimeout(self.timeout))
            }
        }
    }

    async fn send(&self, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TurnstileError::BackendTimeout(self.timeout)
                } else {
                    TurnstileError::Http(e)
                }
            })?;

        let status = response.status();
        let text = response.text().await?;
        let reply: Option<UpstashReply> = serde_json::from_str(&text).ok();

        if let Some(message) = reply.as_ref().and_then(|r| r.error.clone()) {
            return Err(TurnstileError::Backend(format!("{} ({})", message, status)));
        }
        if !status.is_success() {
            return Err(TurnstileError::Backend(format!(
                "Upstash returned {}: {}",
                status, text
            )));
        }

        reply
            .and_then(|r| r.result)
            .ok_or_else(|| TurnstileError::Backend(format!("malformed Upstash reply: {}", text)))
    }
}

/// Convert the script reply into `(remaining, ms_until_reset)`.
fn parse_script_reply(value: &Value) -> Result<(i64, i64)> {
    let malformed = || TurnstileError::Backend(format!("unexpected script reply: {}", value));
    let items = value.as_array().ok_or_else(malformed)?;
    if items.len() != 2 {
        return Err(malformed());
    }
    let as_int = |v: &Value| {
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(malformed)
    };
    Ok((as_int(&items[0])?, as_int(&items[1])?))
}

#[async_trait]
impl RateLimiterBackend for UpstashRateLimiter {
    async fn check(&self, identifier: &str, config: &RateLimitConfig) -> Result<RateLimitResult> {
        let now = self.clock.now_millis();
        let window = config.window_millis();
        let current = now.div_euclid(window);

        let body = json!([
            "EVAL",
            SLIDING_WINDOW_SCRIPT,
            "2",
            self.window_key(identifier, current),
            self.window_key(identifier, current - 1),
            config.max_requests().to_string(),
            now.to_string(),
            window.to_string(),
        ]);

        let reply = self.command(body).await?;
        let (remaining, until_reset) = parse_script_reply(&reply)?;
        let reset = now + until_reset.max(0);

        trace!(
            identifier = %identifier,
            remaining,
            reset,
            "Checked Upstash rate limit"
        );

        if remaining < 0 {
            debug!(
                identifier = %identifier,
                limit = config.max_requests(),
                reset,
                "Rate limit exceeded"
            );
            Ok(RateLimitResult::denied(reset))
        } else {
            Ok(RateLimitResult::allowed(remaining as u64, reset))
        }
    }

    fn name(&self) -> &'static str {
        "upstash"
    }
}

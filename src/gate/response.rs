//! HTTP rendering of admission outcomes.

use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::{Admission, Quota};

/// Budget per window.
pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
/// Requests left in the window.
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Window end in epoch milliseconds.
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";
/// Set when a request was let through because the backend was unavailable.
pub const BYPASS_HEADER: &str = "x-ratelimit-bypass";

/// Write the three rate limit headers for `quota`.
pub fn apply_quota_headers(headers: &mut HeaderMap, quota: &Quota) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(quota.reset));
}

/// Whole seconds until `reset`, rounded up, never below one.
pub(super) fn retry_after_secs(reset: i64, now: i64) -> u64 {
    let millis = reset.saturating_sub(now).max(0) as u64;
    millis.div_ceil(1000).max(1)
}

impl IntoResponse for Admission {
    fn into_response(self) -> Response {
        match self {
            Admission::Allowed(quota) => {
                let mut response = (StatusCode::OK, Json(json!({ "success": true }))).into_response();
                apply_quota_headers(response.headers_mut(), &quota);
                response
            }
            Admission::Limited { quota, retry_after } => {
                let body = json!({
                    "success": false,
                    "error": "Too many requests",
                    "limit": quota.limit,
                    "remaining": 0,
                    "reset": quota.reset,
                });
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let headers = response.headers_mut();
                apply_quota_headers(headers, &quota);
                headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            Admission::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "Invalid CSRF token" })),
            )
                .into_response(),
        }
    }
}

/// Response for a fail-closed route whose backend could not decide.
pub(crate) fn unavailable_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "Rate limiter unavailable" })),
    )
        .into_response()
}

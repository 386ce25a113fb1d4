//! Client identity resolution.
//!
//! Turns the network origin headers of a request into the string used to key
//! rate limit counters. Headers are consulted in a fixed order:
//!
//! 1. `cf-connecting-ip`, set by the CDN edge. Always trusted; a deployment
//!    that exposes this service without its edge in front must strip it.
//! 2. Only when proxy headers are trusted: `x-real-ip`, then the leftmost
//!    entry of `x-forwarded-for`. The remaining entries are intermediate
//!    proxies.
//! 3. The loopback literal.
//!
//! Trust is off by default. A directly reachable service that honours
//! forwarded headers lets any client pick its own rate limit key, either to
//! dodge its budget or to burn someone else's.

use axum::http::HeaderMap;

/// CDN edge header carrying the connecting client address.
pub const CF_CONNECTING_IP: &str = "cf-connecting-ip";
/// Real-IP header set by a reverse proxy.
pub const X_REAL_IP: &str = "x-real-ip";
/// Forwarded-for chain set by reverse proxies.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Identity used when no usable header is present.
pub const FALLBACK_IDENTITY: &str = "127.0.0.1";

/// Derives a client identity from request headers under a fixed trust policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientIdentityResolver {
    trust_proxy_headers: bool,
}

impl ClientIdentityResolver {
    /// Create a resolver. `trust_proxy_headers` comes from deployment
    /// configuration, never from the request.
    pub fn new(trust_proxy_headers: bool) -> Self {
        Self {
            trust_proxy_headers,
        }
    }

    /// Whether real-IP and forwarded-for headers are honoured.
    pub fn trusts_proxy_headers(&self) -> bool {
        self.trust_proxy_headers
    }

    /// Resolve the identity of the request. Never fails.
    pub fn resolve(&self, headers: &HeaderMap) -> String {
        if let Some(ip) = header_value(headers, CF_CONNECTING_IP) {
            return ip.to_string();
        }

        if self.trust_proxy_headers {
            if let Some(ip) = header_value(headers, X_REAL_IP) {
                return ip.to_string();
            }
            if let Some(ip) = header_value(headers, X_FORWARDED_FOR)
                .and_then(|chain| chain.split(',').next())
                .map(str::trim)
                .filter(|first| !first.is_empty())
            {
                return ip.to_string();
            }
        }

        FALLBACK_IDENTITY.to_string()
    }

    /// Counter key for a request on a given route: `<identity>:<route>`.
    pub fn key_for(&self, headers: &HeaderMap, route_tag: &str) -> String {
        format!("{}:{}", self.resolve(headers), route_tag)
    }
}

/// Trimmed, non-empty, visible-ASCII header value.
fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

//! Shared-secret check for state-changing routes.

use std::fmt;

use axum::http::HeaderMap;

use crate::config::CsrfConfig;

/// Request header carrying the shared secret.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Compares the request's CSRF header against a configured secret.
///
/// A disabled guard accepts every request.
#[derive(Clone, Default)]
pub struct CsrfGuard {
    secret: Option<String>,
}

impl fmt::Debug for CsrfGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfGuard")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl CsrfGuard {
    /// A guard that lets everything through.
    pub fn disabled() -> Self {
        Self { secret: None }
    }

    /// A guard requiring `secret` on every checked request.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }

    /// Build from validated configuration.
    pub fn from_config(config: &CsrfConfig) -> Self {
        match &config.token {
            Some(token) if config.enabled => Self::with_secret(token.clone()),
            _ => Self::disabled(),
        }
    }

    /// Whether a secret is configured.
    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Whether the request carries exactly the configured secret.
    pub fn verify(&self, headers: &HeaderMap) -> bool {
        let Some(secret) = &self.secret else {
            return true;
        };

        headers
            .get(CSRF_HEADER)
            .map(|value| constant_time_eq(value.as_bytes(), secret.as_bytes()))
            .unwrap_or(false)
    }
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn with_token(token: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CSRF_HEADER, HeaderValue::from_static(token));
        headers
    }

    #[test]
    fn test_disabled_guard_accepts_everything() {
        let guard = CsrfGuard::disabled();
        assert!(guard.verify(&HeaderMap::new()));
        assert!(guard.verify(&with_token("anything")));
    }

    #[test]
    fn test_exact_match_required() {
        let guard = CsrfGuard::with_secret("S");

        assert!(guard.verify(&with_token("S")));
        assert!(!guard.verify(&with_token("s")));
        assert!(!guard.verify(&with_token("S ")));
        assert!(!guard.verify(&with_token("SS")));
        assert!(!guard.verify(&with_token("")));
        assert!(!guard.verify(&HeaderMap::new()));
    }

    #[test]
    fn test_from_config() {
        let enabled = CsrfConfig {
            enabled: true,
            token: Some("secret".to_string()),
        };
        assert!(CsrfGuard::from_config(&enabled).is_enabled());
        assert!(!CsrfGuard::from_config(&CsrfConfig::default()).is_enabled());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}

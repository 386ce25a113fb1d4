//! Configuration management for Turnstile.
//!
//! Settings come from environment variables, optionally layered over a YAML
//! file with the same keys in lowercase. Everything is validated once at
//! startup; a bad combination (an external backend without credentials, a
//! CSRF gate without a secret) stops the process before it serves traffic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::DEFAULT_MAX_ENTRIES;

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnstileConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Rate limiting configuration
    pub rate_limiting: RateLimitingConfig,

    /// Shared-secret gate for mutating routes
    pub csrf: CsrfConfig,

    /// Honour `x-real-ip` / `x-forwarded-for`
    pub trust_proxy_headers: bool,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// HTTP listener address
    pub bind_addr: SocketAddr,

    /// Optional YAML file with per-route rules
    pub rules_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            rules_path: None,
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8088))
}

/// Which rate limiter backs the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RateLimitMode {
    /// In-process counters
    #[default]
    Inmem,
    /// Upstash Redis shared by every instance
    Upstash,
}

impl FromStr for RateLimitMode {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INMEM" => Ok(RateLimitMode::Inmem),
            "UPSTASH" => Ok(RateLimitMode::Upstash),
            other => Err(TurnstileError::Config(format!(
                "RATE_LIMIT_MODE must be INMEM or UPSTASH, got {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for RateLimitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitMode::Inmem => write!(f, "INMEM"),
            RateLimitMode::Upstash => write!(f, "UPSTASH"),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitingConfig {
    /// Selected backend
    pub mode: RateLimitMode,

    /// Connection settings, present iff `mode` is `Upstash`
    pub upstash: Option<UpstashConfig>,

    /// Maximum number of in-process counters
    pub max_entries: usize,

    /// Seconds between background sweeps of expired counters; 0 disables
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            mode: RateLimitMode::Inmem,
            upstash: None,
            max_entries: DEFAULT_MAX_ENTRIES,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Upstash REST connection settings.
#[derive(Clone, Serialize)]
pub struct UpstashConfig {
    pub rest_url: String,
    #[serde(skip_serializing)]
    pub rest_token: String,
    /// Per-call deadline in milliseconds
    pub timeout_ms: u64,
    pub key_prefix: String,
}

impl fmt::Debug for UpstashConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstashConfig")
            .field("rest_url", &self.rest_url)
            .field("rest_token", &"<redacted>")
            .field("timeout_ms", &self.timeout_ms)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

fn default_upstash_timeout_ms() -> u64 {
    2000
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

/// Shared-secret gate configuration.
#[derive(Clone, Default, Serialize)]
pub struct CsrfConfig {
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl fmt::Debug for CsrfConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfConfig")
            .field("enabled", &self.enabled)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Raw settings as they appear in the environment, before validation.
#[derive(Debug, Default, Deserialize)]
pub struct EnvSettings {
    pub rate_limit_mode: Option<String>,
    pub upstash_redis_rest_url: Option<String>,
    pub upstash_redis_rest_token: Option<String>,
    pub upstash_timeout_ms: Option<u64>,
    pub upstash_key_prefix: Option<String>,
    pub rate_limit_max_entries: Option<usize>,
    pub rate_limit_sweep_interval_secs: Option<u64>,
    pub csrf_protection: Option<bool>,
    pub csrf_protection_token: Option<String>,
    pub trust_proxy_headers: Option<bool>,
    pub turnstile_bind_addr: Option<String>,
    pub turnstile_rules_path: Option<String>,
}

/// `Some` only for values that are not blank.
fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TryFrom<EnvSettings> for TurnstileConfig {
    type Error = TurnstileError;

    fn try_from(raw: EnvSettings) -> Result<Self> {
        let mode = match non_blank(raw.rate_limit_mode) {
            Some(mode) => mode.parse()?,
            None => RateLimitMode::default(),
        };

        let upstash = match mode {
            RateLimitMode::Inmem => None,
            RateLimitMode::Upstash => {
                let rest_url = non_blank(raw.upstash_redis_rest_url);
                let rest_token = non_blank(raw.upstash_redis_rest_token);
                let (rest_url, rest_token) = match (rest_url, rest_token) {
                    (Some(url), Some(token)) => (url, token),
                    (url, _) => {
                        let missing = if url.is_none() {
                            "UPSTASH_REDIS_REST_URL"
                        } else {
                            "UPSTASH_REDIS_REST_TOKEN"
                        };
                        return Err(TurnstileError::Config(format!(
                            "RATE_LIMIT_MODE=UPSTASH requires {}",
                            missing
                        )));
                    }
                };

                let timeout_ms = raw.upstash_timeout_ms.unwrap_or_else(default_upstash_timeout_ms);
                if timeout_ms == 0 {
                    return Err(TurnstileError::Config(
                        "UPSTASH_TIMEOUT_MS must be greater than zero".to_string(),
                    ));
                }

                Some(UpstashConfig {
                    rest_url,
                    rest_token,
                    timeout_ms,
                    key_prefix: non_blank(raw.upstash_key_prefix).unwrap_or_else(default_key_prefix),
                })
            }
        };

        let max_entries = raw.rate_limit_max_entries.unwrap_or(DEFAULT_MAX_ENTRIES);
        if max_entries == 0 {
            return Err(TurnstileError::Config(
                "RATE_LIMIT_MAX_ENTRIES must be greater than zero".to_string(),
            ));
        }

        let csrf_enabled = raw.csrf_protection.unwrap_or(false);
        let csrf_token = non_blank(raw.csrf_protection_token);
        if csrf_enabled && csrf_token.is_none() {
            return Err(TurnstileError::Config(
                "CSRF_PROTECTION is enabled but CSRF_PROTECTION_TOKEN is not set".to_string(),
            ));
        }

        let bind_addr = match non_blank(raw.turnstile_bind_addr) {
            Some(addr) => addr.trim().parse().map_err(|e| {
                TurnstileError::Config(format!("invalid TURNSTILE_BIND_ADDR {:?}: {}", addr, e))
            })?,
            None => default_bind_addr(),
        };

        Ok(TurnstileConfig {
            server: ServerConfig {
                bind_addr,
                rules_path: non_blank(raw.turnstile_rules_path).map(PathBuf::from),
            },
            rate_limiting: RateLimitingConfig {
                mode,
                upstash,
                max_entries,
                sweep_interval_secs: raw
                    .rate_limit_sweep_interval_secs
                    .unwrap_or_else(default_sweep_interval),
            },
            csrf: CsrfConfig {
                enabled: csrf_enabled,
                token: if csrf_enabled { csrf_token } else { None },
            },
            trust_proxy_headers: raw.trust_proxy_headers.unwrap_or(false),
        })
    }
}

impl TurnstileConfig {
    /// Load from the process environment, layered over an optional YAML file.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        let builder = builder.add_source(config::Environment::default());
        Self::from_builder(builder)
    }

    /// Load from an explicit variable map instead of the process environment.
    pub fn from_env_map(vars: HashMap<String, String>) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::Environment::default().source(Some(vars)));
        Self::from_builder(builder)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let settings: EnvSettings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        Self::try_from(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::try_from(EnvSettings::default()).unwrap();

        assert_eq!(config.rate_limiting.mode, RateLimitMode::Inmem);
        assert!(config.rate_limiting.upstash.is_none());
        assert_eq!(config.rate_limiting.max_entries, DEFAULT_MAX_ENTRIES);
        assert!(!config.csrf.enabled);
        assert!(!config.trust_proxy_headers);
        assert_eq!(config.server.bind_addr, default_bind_addr());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("inmem".parse::<RateLimitMode>().unwrap(), RateLimitMode::Inmem);
        assert_eq!(" UPSTASH ".parse::<RateLimitMode>().unwrap(), RateLimitMode::Upstash);
        assert!("redis".parse::<RateLimitMode>().is_err());
    }

    #[test]
    fn test_upstash_requires_credentials() {
        let raw = EnvSettings {
            rate_limit_mode: Some("UPSTASH".to_string()),
            upstash_redis_rest_url: Some("https://eu1.upstash.io".to_string()),
            ..EnvSettings::default()
        };
        let err = TurnstileConfig::try_from(raw).unwrap_err();
        assert!(err.to_string().contains("UPSTASH_REDIS_REST_TOKEN"));

        let raw = EnvSettings {
            rate_limit_mode: Some("UPSTASH".to_string()),
            upstash_redis_rest_token: Some("token".to_string()),
            ..EnvSettings::default()
        };
        let err = TurnstileConfig::try_from(raw).unwrap_err();
        assert!(err.to_string().contains("UPSTASH_REDIS_REST_URL"));
    }

    #[test]
    fn test_upstash_config() {
        let raw = EnvSettings {
            rate_limit_mode: Some("upstash".to_string()),
            upstash_redis_rest_url: Some("https://eu1.upstash.io".to_string()),
            upstash_redis_rest_token: Some("token".to_string()),
            ..EnvSettings::default()
        };
        let config = TurnstileConfig::try_from(raw).unwrap();
        let upstash = config.rate_limiting.upstash.unwrap();

        assert_eq!(upstash.rest_url, "https://eu1.upstash.io");
        assert_eq!(upstash.timeout_ms, 2000);
        assert_eq!(upstash.key_prefix, "turnstile");
    }

    #[test]
    fn test_csrf_requires_token() {
        let raw = EnvSettings {
            csrf_protection: Some(true),
            csrf_protection_token: Some("   ".to_string()),
            ..EnvSettings::default()
        };
        assert!(matches!(
            TurnstileConfig::try_from(raw),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_csrf_token_ignored_when_disabled() {
        let raw = EnvSettings {
            csrf_protection: Some(false),
            csrf_protection_token: Some("secret".to_string()),
            ..EnvSettings::default()
        };
        let config = TurnstileConfig::try_from(raw).unwrap();
        assert!(config.csrf.token.is_none());
    }

    #[test]
    fn test_invalid_bind_addr() {
        let raw = EnvSettings {
            turnstile_bind_addr: Some("not-an-addr".to_string()),
            ..EnvSettings::default()
        };
        assert!(TurnstileConfig::try_from(raw).is_err());
    }

    #[test]
    fn test_from_env_map() {
        let config = TurnstileConfig::from_env_map(vars(&[
            ("RATE_LIMIT_MODE", "INMEM"),
            ("CSRF_PROTECTION", "true"),
            ("CSRF_PROTECTION_TOKEN", "S"),
            ("TRUST_PROXY_HEADERS", "true"),
            ("RATE_LIMIT_MAX_ENTRIES", "500"),
            ("TURNSTILE_BIND_ADDR", "0.0.0.0:9000"),
        ]))
        .unwrap();

        assert!(config.csrf.enabled);
        assert_eq!(config.csrf.token.as_deref(), Some("S"));
        assert!(config.trust_proxy_headers);
        assert_eq!(config.rate_limiting.max_entries, 500);
        assert_eq!(config.server.bind_addr.port(), 9000);
    }

    #[test]
    fn test_from_env_map_rejects_missing_upstash_secrets() {
        let result = TurnstileConfig::from_env_map(vars(&[("RATE_LIMIT_MODE", "UPSTASH")]));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = TurnstileConfig {
            csrf: CsrfConfig {
                enabled: true,
                token: Some("hunter2".to_string()),
            },
            ..TurnstileConfig::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}

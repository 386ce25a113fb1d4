//! Per-route rate limit rules.
//!
//! Each protected route is identified by a short tag (`newsletter`,
//! `bookmarks`, ...). The tag is appended to the client identity to form the
//! counter key, so every route has its own budget per client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::policy::RateLimitConfig;
use crate::error::{Result, TurnstileError};

/// What to do with a request when the rate limit backend cannot decide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through
    Open,
    /// Reject the request
    #[default]
    Closed,
}

/// Budget and gating options for one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Route tag; filled from the map key when loaded from YAML
    #[serde(default)]
    pub tag: String,
    /// Request budget
    #[serde(flatten)]
    pub limit: RateLimitConfig,
    /// Whether the route changes state and must pass the CSRF gate
    #[serde(default)]
    pub mutating: bool,
    /// Behaviour when the backend is unavailable
    #[serde(default)]
    pub on_backend_error: FailurePolicy,
}

impl RouteRule {
    /// Create a rule failing closed.
    pub fn new(tag: &str, limit: RateLimitConfig, mutating: bool) -> Self {
        Self {
            tag: tag.to_string(),
            limit,
            mutating,
            on_backend_error: FailurePolicy::Closed,
        }
    }

    /// Override the backend failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_backend_error = policy;
        self
    }
}

/// The full set of route rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRules {
    /// Map of route tag to rule
    #[serde(default)]
    pub routes: HashMap<String, RouteRule>,
}

impl RouteRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for the platform's protected endpoints.
    pub fn builtin() -> Self {
        let mut rules = Self::new();
        for (tag, max_requests, mutating) in [
            ("newsletter", 3, true),
            ("bookmarks", 20, true),
            ("quiz", 10, true),
            ("forum", 5, true),
            ("default", 60, false),
        ] {
            // Constants above are all positive.
            if let Ok(limit) = RateLimitConfig::new(max_requests, 60_000) {
                rules.insert(RouteRule::new(tag, limit, mutating));
            }
        }
        rules
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut rules: RouteRules = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse route rules: {}", e)))?;

        for (tag, rule) in rules.routes.iter_mut() {
            if tag.trim().is_empty() {
                return Err(TurnstileError::Config("route tag must not be empty".to_string()));
            }
            rule.tag = tag.clone();
        }

        Ok(rules)
    }

    /// Add or replace a rule.
    pub fn insert(&mut self, rule: RouteRule) {
        self.routes.insert(rule.tag.clone(), rule);
    }

    /// Look up the rule for a route tag.
    pub fn get(&self, tag: &str) -> Option<&RouteRule> {
        self.routes.get(tag)
    }

    /// Number of configured routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are configured.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

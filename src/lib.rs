//! Turnstile - Request Admission Control
//!
//! This crate decides whether an incoming request may reach application
//! logic. It resolves a client identity from network headers under an
//! explicit trust policy, checks a shared-secret CSRF token on mutating
//! routes, and counts the request against a per-route budget held either in
//! process memory or in Upstash Redis shared by every instance.

pub mod config;
pub mod error;
pub mod gate;
pub mod http;
pub mod identity;
pub mod ratelimit;

pub use config::TurnstileConfig;
pub use error::{Result, TurnstileError};
pub use gate::{Admission, AdmissionGate, Quota};
pub use identity::ClientIdentityResolver;

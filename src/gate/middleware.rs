//! Axum middleware running requests through an [`AdmissionGate`].

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tracing::error;

use super::response::{apply_quota_headers, unavailable_response, BYPASS_HEADER};
use super::{Admission, AdmissionGate};
use crate::error::TurnstileError;
use crate::ratelimit::{FailurePolicy, RouteRule};

/// State for a protected route: the shared gate and the route's rule.
#[derive(Clone)]
pub struct ProtectedRoute {
    pub gate: AdmissionGate,
    pub rule: Arc<RouteRule>,
}

impl ProtectedRoute {
    /// Pair a gate with the rule it enforces.
    pub fn new(gate: AdmissionGate, rule: RouteRule) -> Self {
        Self {
            gate,
            rule: Arc::new(rule),
        }
    }
}

/// Log a backend failure and decide per the route's policy.
///
/// Returns `None` if the request should proceed (fail open) or the rejection
/// to send (fail closed).
pub(crate) fn backend_failure(rule: &RouteRule, err: &TurnstileError) -> Option<Response> {
    error!(
        route = %rule.tag,
        policy = ?rule.on_backend_error,
        error = %err,
        "Rate limit backend unavailable"
    );
    match rule.on_backend_error {
        FailurePolicy::Open => None,
        FailurePolicy::Closed => Some(unavailable_response()),
    }
}

/// Mark a response as admitted without a rate limit decision.
pub(crate) fn mark_bypassed(response: &mut Response) {
    response
        .headers_mut()
        .insert(BYPASS_HEADER, HeaderValue::from_static("backend-unavailable"));
}

/// Gate the inner handler. Admitted responses carry the rate limit headers.
pub async fn admission_middleware(
    State(route): State<ProtectedRoute>,
    request: Request,
    next: Next,
) -> Response {
    let outcome = route.gate.admit(request.headers(), &route.rule).await;
    match outcome {
        Ok(Admission::Allowed(quota)) => {
            let mut response = next.run(request).await;
            apply_quota_headers(response.headers_mut(), &quota);
            response
        }
        Ok(rejected) => rejected.into_response(),
        Err(err) => match backend_failure(&route.rule, &err) {
            Some(rejection) => rejection,
            None => {
                let mut response = next.run(request).await;
                mark_bypassed(&mut response);
                response
            }
        },
    }
}

/// Put every route of `router` behind the gate under `rule`.
pub fn protect<S>(router: Router<S>, gate: AdmissionGate, rule: RouteRule) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(
        ProtectedRoute::new(gate, rule),
        admission_middleware,
    ))
}

//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};

use crate::error::{Result, TurnstileError};
use crate::gate::middleware::{backend_failure, mark_bypassed};
use crate::gate::AdmissionGate;
use crate::ratelimit::RouteRules;

/// State shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: AdmissionGate,
    pub rules: Arc<RouteRules>,
}

/// HTTP server exposing the admission gate.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    /// Create a new server for the given gate and route rules.
    pub fn new(addr: SocketAddr, gate: AdmissionGate, rules: RouteRules) -> Self {
        Self {
            addr,
            state: AppState {
                gate,
                rules: Arc::new(rules),
            },
        }
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TurnstileError::Io(e)
        })?;

        info!(
            addr = %listener.local_addr()?,
            backend = self.state.gate.backend_name(),
            routes = self.state.rules.len(),
            "Starting admission HTTP server"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TurnstileError::Io(e)
            })
    }
}

/// Router with `/healthz` and `/admit/{route}`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/admit/{route}", any(admit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "backend": state.gate.backend_name(),
    }))
}

/// Forward-auth check for one route.
#[instrument(skip_all, fields(route = %route))]
async fn admit(
    State(state): State<AppState>,
    Path(route): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(rule) = state.rules.get(&route) else {
        debug!("Admission requested for unknown route");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown route" })),
        )
            .into_response();
    };

    match state.gate.admit(&headers, rule).await {
        Ok(outcome) => outcome.into_response(),
        Err(err) => backend_failure(rule, &err).unwrap_or_else(|| {
            let mut response = (StatusCode::OK, Json(json!({ "success": true }))).into_response();
            mark_bypassed(&mut response);
            response
        }),
    }
}

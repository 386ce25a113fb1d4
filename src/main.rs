use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::gate::AdmissionGate;
use turnstile::http::HttpServer;
use turnstile::ratelimit::{build_backend, RouteRules};

/// Request admission control service.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// YAML settings file, overridden by environment variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listener address, overrides TURNSTILE_BIND_ADDR
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Turnstile admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Invalid settings stop the process here, before anything is served.
    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    info!(
        bind_addr = %config.server.bind_addr,
        mode = %config.rate_limiting.mode,
        csrf = config.csrf.enabled,
        trust_proxy_headers = config.trust_proxy_headers,
        "Configuration loaded"
    );

    let rules = match &config.server.rules_path {
        Some(path) => RouteRules::from_file(path)?,
        None => RouteRules::builtin(),
    };
    info!(routes = rules.len(), "Route rules loaded");

    let selected = build_backend(&config.rate_limiting).await?;
    let sweeper = match (&selected.in_memory, config.rate_limiting.sweep_interval_secs) {
        (Some(limiter), secs) if secs > 0 => {
            Some(limiter.spawn_sweeper(Duration::from_secs(secs)))
        }
        _ => None,
    };

    let gate = AdmissionGate::from_config(&config, selected.backend);
    let server = HttpServer::new(config.server.bind_addr, gate, rules);

    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }

    info!("Turnstile admission service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("turnstile=info,tower_http=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

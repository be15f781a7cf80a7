use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

mod app;
mod auth;
mod error;
mod http;
mod ratelimit;
mod turn;

/// How often overdue escalations are swept to `expired`.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "sibyl-gateway", about = "Sibyl orchestrator gateway")]
struct Cli {
    /// Path to sibyl.toml (defaults to ~/.sibyl/sibyl.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sibyl_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = sibyl_core::config::SibylConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        sibyl_core::config::SibylConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = app::AppState::bootstrap(config)?;

    // Background escalation expiry sweep — pending offers past 72h and
    // accepted items past 14d transition to expired, with an
    // in-conversation notice for the asking user.
    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match sweeper.orchestrator.sweep_expired(chrono::Utc::now()) {
                Ok(0) => {}
                Ok(n) => info!(expired = n, "escalation sweep"),
                Err(e) => warn!(error = %e, "escalation sweep failed"),
            }
        }
    });

    let router = app::build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("Sibyl gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            state.teardown();
        })
        .await?;

    Ok(())
}

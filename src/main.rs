// =============================================================================
// Rotation Bot — Runtime Entrypoint (C12)
// =============================================================================
//
// Loads `.env` and the rotation config, builds the two venue adapters, spawns
// the read-only status API, then runs the controller loop to completion on
// SIGINT/SIGTERM. Exit code 0 on a clean shutdown, 1 if startup itself fails.

mod api;
mod app_state;
mod config;
mod controller;
mod decimal_math;
mod error;
mod executor;
mod monitor;
mod persistence;
mod portfolio;
mod reconcile;
mod scanner;
mod sizing;
mod types;
mod venue;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::RotationConfig;
use crate::controller::Controller;
use crate::executor::VenuePair;
use crate::types::{CapitalStatus, VenueId};
use crate::venue::RestVenueAdapter;

/// Delta-neutral funding-rate rotation engine, two perpetual-futures venues.
#[derive(Parser, Debug)]
#[command(name = "rotation-bot", version)]
struct Cli {
    /// Path to the durable state file (BotState, Position, cumulative stats).
    #[arg(long, default_value = "rotation_state.json")]
    state_file: PathBuf,

    /// Path to the hot-editable rotation config JSON.
    #[arg(long, default_value = "rotation_config.json")]
    config: PathBuf,

    /// Address the read-only status API binds to.
    #[arg(long, default_value = "0.0.0.0:8088")]
    bind_addr: String,
}

fn venue_adapter(id: VenueId, key_env: &str, secret_env: &str, url_env: &str) -> RestVenueAdapter {
    let api_key = std::env::var(key_env).unwrap_or_default();
    let secret = std::env::var(secret_env).unwrap_or_default();
    let base_url = std::env::var(url_env)
        .unwrap_or_else(|_| panic!("{url_env} must be set — no default venue endpoint"));

    if api_key.is_empty() || secret.is_empty() {
        warn!(venue = %id, key_env, secret_env, "env vars not set — signed requests to this venue will be rejected");
    }

    RestVenueAdapter::new(id, api_key, secret, base_url)
}

/// Wait for Ctrl-C or, on unix, SIGTERM — whichever arrives first.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    info!("rotation-bot starting up");

    let cfg = match RotationConfig::load_or_default(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "failed to load rotation config");
            return Err(e);
        }
    };

    let venue_a = venue_adapter(VenueId::A, "VENUE_A_API_KEY", "VENUE_A_API_SECRET", "VENUE_A_BASE_URL");
    let venue_b = venue_adapter(VenueId::B, "VENUE_B_API_KEY", "VENUE_B_API_SECRET", "VENUE_B_BASE_URL");

    let venues = VenuePair {
        a: Arc::new(venue_a),
        b: Arc::new(venue_b),
    };

    let app_state = Arc::new(AppState::new(CapitalStatus::empty(chrono::Utc::now())));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_state = app_state.clone();
    let bind_addr = cli.bind_addr.clone();
    let api_handle = tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind status API, continuing without it");
                return;
            }
        };
        info!(addr = %bind_addr, "status API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "status API server exited with an error");
        }
    });

    let controller = Controller::new(venues, app_state, cfg, cli.config.clone(), cli.state_file);
    let controller_handle = tokio::spawn(controller.run(shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);

    if let Err(e) = controller_handle.await {
        error!(error = %e, "controller task panicked");
        api_handle.abort();
        return Err(anyhow::anyhow!("controller task panicked: {e}"));
    }

    api_handle.abort();
    info!("rotation-bot shut down complete");
    Ok(())
}

// =============================================================================
// Kline Relay — Main Entry Point
// =============================================================================
//
// Relays Binance kline streams to WebSocket subscribers: each subscriber gets
// a bounded history snapshot per symbol, then every live update.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod binance;
mod market_data;
mod relay;
mod runtime_config;
mod types;

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::{BinanceClient, BinanceFeed};
use crate::relay::Relay;
use crate::runtime_config::{Credentials, RuntimeConfig};

const DEFAULT_CONFIG_PATH: &str = "relay_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Kline relay starting up");

    let config_path =
        std::env::var("RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env()?;
    config.validate()?;

    info!(
        symbols = ?config.symbols,
        interval = %config.interval,
        history_limit = config.history_limit,
        "Configured relay"
    );

    // ── 2. Upstream credentials ──────────────────────────────────────────
    let credentials = match Credentials::from_env() {
        Ok(creds) => creds,
        Err(e) => {
            error!(error = %e, "Live feed credentials missing, refusing to start");
            return Err(e.into());
        }
    };

    // ── 3. Relay ─────────────────────────────────────────────────────────
    let client = BinanceClient::new(&credentials)?;
    let relay = Relay::new(&config, Arc::new(BinanceFeed::new(client)));
    relay.start();

    // ── 4. API server ────────────────────────────────────────────────────
    let app = api::rest::router(relay.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "API server listening");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    // Shutting the relay down closes every subscriber queue, which ends the
    // open WebSocket connections the server would otherwise wait on.
    let shutdown_relay = relay.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            warn!("Shutdown signal received, stopping gracefully");
            shutdown_relay.shutdown();
        })
        .await?;

    info!("Kline relay shut down complete.");
    Ok(())
}

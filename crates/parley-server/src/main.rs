//! # Parley Server
//!
//! Direct-message presence and delivery server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a signing secret for bearer tokens
//! PARLEY_JWT_SECRET=change-me parley
//!
//! # Override any config key through the environment
//! PARLEY_PORT=8080 PARLEY_LIMITS__MAX_CONNECTIONS=5000 parley
//! ```
//!
//! Clients connect to `ws://host:port/ws?token=<jwt>&encoding=json`.

mod api;
mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load().context("Failed to load configuration")?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}

//! # Relay Server
//!
//! Durable message broker with independently-progressing consumer groups.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relayd
//!
//! # Run with environment variables
//! RELAY_PORT=7070 RELAY_STORAGE_ROOT=/var/lib/relay relayd
//! ```
//!
//! Configuration is read from `relay.toml` (working directory,
//! `/etc/relay/`, or `~/.config/relay/`) when present.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

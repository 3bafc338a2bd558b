//! # Relay Server
//!
//! Real-time direct-messaging server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a signing secret and the default database
//! RELAY_JWT_SECRET=change-me relay
//!
//! # Run with environment overrides
//! RELAY_PORT=8080 RELAY_HOST=0.0.0.0 RELAY_DATABASE=/var/lib/relay/relay.db relay
//! ```
//!
//! A `relay.toml` in the working directory, `/etc/relay/` or
//! `~/.config/relay/` takes precedence over the environment.

use anyhow::Result;
use relay_server::{config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug".into()),
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

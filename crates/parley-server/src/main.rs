//! # Parley Server
//!
//! Presence and call-signaling relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (127.0.0.1:5000)
//! parley
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 parley
//!
//! # Nested settings use a double underscore
//! PARLEY_LIMITS__MAX_CONNECTIONS=500 parley
//! ```

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
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Parley server v{} on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr()
    );

    // Initialize metrics
    metrics::init_metrics();

    // Runs until SIGINT/SIGTERM, then drains sessions
    handlers::run_server(config).await?;

    Ok(())
}

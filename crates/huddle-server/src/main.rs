//! # Huddle Server
//!
//! Realtime group chat with a durable message log.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (127.0.0.1:3000, history in ./data.json)
//! huddle
//!
//! # Run with a specific config file
//! HUDDLE_CONFIG=/path/to/huddle.toml huddle
//!
//! # Override individual settings
//! HUDDLE_PORT=8080 HUDDLE_STORE__PATH=/var/lib/huddle/data.json huddle
//! ```

use anyhow::Result;
use huddle_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Huddle server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}

//! Sparkle CQRS supervisor.
//!
//! One process owns the database pool and the Redis connection, and runs the outbox
//! publisher, maintenance tasks, one worker per projection group and the operational
//! HTTP routes.

mod config;
mod supervisor;

use config::Config;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // RUST_LOG overrides LOG_LEVEL
    let config = Config::from_env();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{},tower_http=info", config.server.log_level))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        address = %config.bind_address(),
        consumer = %config.worker.consumer_name,
        "Starting Sparkle CQRS supervisor"
    );
    for entry in &config.invalid {
        tracing::warn!(entry = %entry, "Invalid configuration value, using default");
    }

    supervisor::run(config).await
}

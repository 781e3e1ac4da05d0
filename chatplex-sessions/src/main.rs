//! Chatplex - Main entry point.

use anyhow::Result;
use chatplex_common::config::Config;
use chatplex_common::logging::init_logging;
use chatplex_sessions::start_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Chatplex v{}", env!("CARGO_PKG_VERSION"));

    // Start the HTTP server
    start_server(&config).await
}

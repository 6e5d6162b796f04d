//! chat-relay server binary.

use chat_relay::config::Config;
use chat_relay::server::Server;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        buffer_size = config.buffer_size,
        "Starting chat-relay server"
    );

    // All connection I/O shares this fixed pool
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .thread_name("relay-worker")
        .enable_all()
        .build()?;

    let server = Arc::new(Server::new(config));
    runtime.block_on(server.start())?;

    info!("Server stopped");
    Ok(())
}

//! tcp-greeter: a single-connection TCP greeting server
//!
//! Accepts one client at a time, sends a fixed greeting, logs whatever the
//! client sends back, and tears the connection down on completion, error, or
//! peer close. Each connection runs as one lifecycle; the driver restarts a
//! fresh lifecycle according to the configured restart policy.
//!
//! Features:
//! - Readiness-based event loop (epoll on Linux, kqueue on macOS)
//! - Idempotent resource release on every termination path
//! - Configuration via CLI arguments or TOML file

mod config;
mod server;

use config::Config;
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
        poll_interval_secs = config.poll_interval,
        max_attempts = config.max_attempts,
        restart_delay_ms = config.restart_delay_ms,
        "Starting tcp-greeter server"
    );

    server::run(&config)?;
    Ok(())
}

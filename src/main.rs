//! lottery-server: collects lottery bets from agencies and reports winners.
//!
//! Each agency connects once, streams its bets in length-prefixed batches and
//! marks the last one with `END`. When the configured number of agencies have
//! finished, the server runs the draw a single time, sends every agency the
//! document ids of its winners over the same connection, and exits.
//!
//! Features:
//! - Configuration via CLI arguments, environment variables or TOML file
//! - In-memory or CSV-file bet storage
//! - Graceful shutdown on SIGTERM/SIGINT
//! - Optional deadline for agencies that never finish

mod bet;
mod codec;
mod config;
mod lottery;
mod protocol;
mod server;
mod session;
mod shutdown;
mod state;
mod storage;

use config::Config;
use lottery::WinningNumber;
use server::{Completion, Server};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        listen_backlog = config.listen_backlog,
        client_total = config.client_total,
        accept_timeout_secs = config.accept_timeout.as_secs(),
        barrier_deadline_secs = config.barrier_deadline.map(|d| d.as_secs()),
        "Starting lottery server"
    );

    let store = storage::open_store(config.bets_file.as_deref())?;
    let draw = Arc::new(WinningNumber(config.winning_number));

    // Binding is the only fatal failure; nothing has been accepted yet.
    let server = Server::bind(config, store, draw).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = shutdown::listen_for_signals(shutdown).await {
            error!(error = %e, "Failed to install signal handlers");
        }
    });

    match server.run().await {
        Completion::Drawn {
            agencies,
            delivered,
        } => info!(agencies, delivered, "Draw finished, exiting"),
        Completion::DrawFailed { agencies } => error!(agencies, "Draw failed, exiting"),
        Completion::DeadlineExpired { finished } => {
            error!(finished, "Not every agency finished in time, exiting without a draw")
        }
        Completion::Shutdown { finished } => info!(finished, "Shut down before the draw"),
    }
    Ok(())
}

//! Tandem relay — WebSocket fan-out for document channels.
//!
//! Configuration comes from the environment:
//!
//! - `TANDEM_RELAY_ADDR` — bind address (default `127.0.0.1:9090`)
//! - `TANDEM_RELAY_CAPACITY` — per-member buffer (default `256`)
//!
//! Logging follows `RUST_LOG`.

use log::{error, info};
use std::process::ExitCode;
use tandem_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = RelayConfig::from_env();
    info!(
        "Starting Tandem relay on {} (capacity {})",
        config.bind_addr, config.channel_capacity
    );
    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Relay stopped: {e}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down after {} connections, {} frames relayed",
                stats.total_connections, stats.frames_relayed
            );
            ExitCode::SUCCESS
        }
    }
}

//! Development relay for scribe-collab clients.
//!
//! Binds `SCRIBE_RELAY_ADDR` (default `127.0.0.1:5000`) and relays rooms
//! until interrupted. Clients authenticate with `Bearer userId[:userName]`.

use log::{error, info};
use scribe_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = RelayConfig::from_env();
    info!("Starting scribe relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down after {} connections, {} edits ({} stale)",
                stats.total_connections, stats.total_edits, stats.conflicts
            );
        }
    }
}

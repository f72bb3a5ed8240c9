//! Scribe server — shared plain-text document over WebSocket.
//!
//! Configuration comes from `SCRIBE_*` environment variables (see
//! `ServerConfig::from_env`); log verbosity from `RUST_LOG`.

use log::{error, info};

use scribe_collab::server::{OtServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting Scribe server on {}...", config.bind_addr);

    let server = OtServer::new(config);
    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            handle.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}

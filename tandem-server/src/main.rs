//! Tandem sync server.
//!
//! Configured through `TANDEM_*` environment variables (see
//! `tandem_collab::config`), logging through `RUST_LOG`. Ctrl-C drains the
//! instance and snapshots every open document before exiting.

use log::info;
use tandem_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    info!("Starting Tandem sync server on {}...", config.bind_addr);

    let server = SyncServer::new(config)?;
    server.run().await?;
    Ok(())
}

//! loadrelay
//!
//! L4 relay that spreads TCP sessions over local backend pools.
//!
//! This service:
//! - Binds the configured listening ports (primary and auxiliary groups)
//! - Assigns each accepted connection to the least loaded backend of its port
//! - Relays raw bytes in both directions until either side closes
//! - Publishes the number of live sessions as a status string

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use loadrelay::config::Config;
use loadrelay::{logging, Bootstrap, ListenerGroup, Server, StatusBoard};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fallback to LOADRELAY_LOG_LEVEL
    logging::init(config.log_format, &config.log_level);

    info!("Starting loadrelay");
    info!(
        role = %config.role,
        bind_addr = %config.bind_addr,
        listen_ports = ?config.listen_ports,
        backend_ports = ?config.backend_ports,
        aux_listen_ports = ?config.aux_listen_ports,
        aux_backend_ports = ?config.aux_backend_ports,
        "Configuration loaded"
    );

    let primary = ListenerGroup::bind(
        "primary",
        config.bind_addr,
        &config.listen_ports,
        config.backend_ports.clone(),
    )
    .context("Failed to bind primary listeners")?;
    let auxiliary = ListenerGroup::bind(
        "auxiliary",
        config.bind_addr,
        &config.aux_listen_ports,
        config.aux_backend_ports.clone(),
    )
    .context("Failed to bind auxiliary listeners")?;

    let server = Arc::new(Server::new(config.role.clone()));
    let status = Arc::new(StatusBoard::new());

    tokio::select! {
        result = loadrelay::run(Bootstrap { primary, auxiliary }, server, status, config.status_interval) => {
            match result {
                Ok(never) => match never {},
                Err(e) => {
                    error!(reason = e.reason_code(), error = %e, "Startup failed");
                    Err(e.into())
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, exiting");
            Ok(())
        }
    }
}

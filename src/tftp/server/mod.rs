//! TFTP server implementation
//!
//! This module provides the server side of the protocol:
//! - `server`: request dispatch loop and the two transfer procedures
//! - `config`: server configuration

mod config;
mod server;

use anyhow::Result;
use std::path::PathBuf;

use crate::tftp::backend::FsBackend;

// Public server types
pub use config::Config;
pub use server::Server;

/// Run a filesystem-backed TFTP server until the socket is torn down.
pub fn run(config: Config) -> Result<()> {
    log::info!("Starting TFTP server on {}:{}", config.ip_address, config.port);
    log::info!("Root directory: {}", config.directory.display());
    log::info!("Read-only mode: {}", config.read_only);

    // Ensure directory exists
    if !config.directory.is_dir() {
        log::error!("Directory does not exist: {}", config.directory.display());
        return Err(anyhow::anyhow!("Directory does not exist"));
    }

    let directory: PathBuf = config.directory.clone();
    let backend = FsBackend::new(directory).with_read_only(config.read_only);
    let mut server = Server::new(config, backend);
    server.start()?;

    log::info!("TFTP server listening, press Ctrl+C to stop");
    let result = server.listen();
    server.stop();
    result
}

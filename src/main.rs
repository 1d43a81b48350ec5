use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use utftpd::tftp::server::{self, Config};

/// Minimal stop-and-wait TFTP server
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// IP address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port number to listen on
    #[arg(short, long, default_value_t = 69)]
    port: u16,

    /// Root directory for served and received files
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Reject all write requests
    #[arg(long)]
    read_only: bool,

    /// TOML configuration file; command-line flags are ignored if set
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::new(cli.bind, cli.port, cli.dir).with_read_only(cli.read_only),
    };

    server::run(config)
}

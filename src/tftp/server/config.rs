use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// TFTP server configuration
///
/// Can be built in code or loaded from a TOML file:
///
/// ```toml
/// ip_address = "0.0.0.0"
/// port = 69
/// directory = "/srv/tftp"
/// read_only = false
/// recv_timeout = "30s"
/// send_timeout = "5s"
/// max_retries = 3
/// ```
///
/// # Example
///
/// ```rust
/// use utftpd::tftp::server::Config;
/// use std::path::PathBuf;
///
/// let config = Config::new(
///     "127.0.0.1".parse().unwrap(),
///     69,
///     PathBuf::from("/tmp/tftp"),
/// );
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// IP address to listen on
    #[serde(default = "default_ip")]
    pub ip_address: IpAddr,
    /// Port number to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Root directory for served and received files
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Whether to reject all write requests
    #[serde(default)]
    pub read_only: bool,
    /// Socket receive timeout, also the per-attempt ACK wait
    #[serde(with = "humantime_serde", default = "default_recv_timeout")]
    pub recv_timeout: Duration,
    /// Socket send timeout
    #[serde(with = "humantime_serde", default = "default_send_timeout")]
    pub send_timeout: Duration,
    /// Send attempts per data block before the transfer is failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    69
}

fn default_directory() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir())
}

fn default_recv_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    3
}

impl Config {
    /// Create a new configuration
    ///
    /// # Arguments
    ///
    /// * `ip_address` - IP address to listen on
    /// * `port` - Port number to listen on; the protocol default 69 is used
    ///   by [`Config::default`] and when the field is absent from a file
    /// * `directory` - Root directory for files
    pub fn new(ip_address: IpAddr, port: u16, directory: PathBuf) -> Self {
        Self {
            ip_address,
            port,
            directory,
            read_only: false,
            recv_timeout: default_recv_timeout(),
            send_timeout: default_send_timeout(),
            max_retries: default_max_retries(),
        }
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Set whether to reject all write requests
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the receive timeout (also the per-attempt ACK wait)
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Set the send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the number of send attempts per data block
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            69,
            default_directory(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.port, 69);
        assert_eq!(config.recv_timeout, Duration::from_secs(30));
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert!(!config.read_only);
    }

    #[test]
    fn parses_toml_with_humantime_durations() {
        let config: Config = toml::from_str(
            r#"
            ip_address = "0.0.0.0"
            port = 6969
            directory = "/srv/tftp"
            recv_timeout = "250ms"
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 6969);
        assert_eq!(config.recv_timeout, Duration::from_millis(250));
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("bogus = 1").is_err());
    }
}

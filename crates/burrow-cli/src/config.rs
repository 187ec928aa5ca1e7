//! # Configuration Module
//!
//! TOML runtime configuration for the `up` command. Peer configuration
//! happens over the control socket; this file only describes the interface
//! the engine runs on.

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub interface: InterfaceSection,
}

#[derive(Debug, Deserialize)]
pub struct InterfaceSection {
    /// TUN device name
    #[serde(default = "default_name")]
    pub name: String,

    /// UDP listen port; also settable later over the control socket
    #[serde(default)]
    pub listen_port: Option<u16>,

    /// File holding the hex static private key
    #[serde(default)]
    pub private_key_file: Option<String>,

    /// Interface address as `address/prefix` (e.g. "10.0.0.1/24")
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default = "default_mtu")]
    pub mtu: i32,

    /// Control socket path; defaults to /var/run/burrow/<name>.sock
    #[serde(default)]
    pub control_socket: Option<String>,

    /// Parallel decryption workers; 0 = automatic
    #[serde(default)]
    pub decryption_workers: usize,
}

fn default_name() -> String {
    "burrow0".to_string()
}

fn default_mtu() -> i32 {
    1420
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&raw).map_err(ConfigError::Parse)
    }

    /// Resolved control socket path
    pub fn control_socket(&self) -> PathBuf {
        match &self.interface.control_socket {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(format!("/var/run/burrow/{}.sock", self.interface.name)),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let cfg: Config = toml::from_str(
            r#"
            [interface]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.interface.name, "burrow0");
        assert_eq!(cfg.interface.mtu, 1420);
        assert!(cfg.interface.listen_port.is_none());
        assert_eq!(
            cfg.control_socket(),
            PathBuf::from("/var/run/burrow/burrow0.sock")
        );
    }

    #[test]
    fn test_full_config() {
        let cfg: Config = toml::from_str(
            r#"
            [interface]
            name = "wg-lab"
            listen_port = 51820
            private_key_file = "/etc/burrow/private.key"
            address = "10.7.0.1/24"
            mtu = 1380
            control_socket = "/tmp/lab.sock"
            decryption_workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.interface.name, "wg-lab");
        assert_eq!(cfg.interface.listen_port, Some(51820));
        assert_eq!(cfg.interface.mtu, 1380);
        assert_eq!(cfg.control_socket(), PathBuf::from("/tmp/lab.sock"));
        assert_eq!(cfg.interface.decryption_workers, 4);
    }
}

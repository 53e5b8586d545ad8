//! Configuration management
//!
//! One immutable [`Config`] is built at startup and handed to the transport
//! and hot-folder components; nothing in the core reads settings on its own.

use std::fmt;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::DEFAULT_SESSION_ID;
use crate::{DEFAULT_LOCAL_PORT_END, DEFAULT_LOCAL_PORT_START, DEFAULT_SERVER_PORT};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote PiMMS server and local interfaces
    pub network: NetworkConfig,

    /// Hot-folder layout
    pub hot_folders: HotFolderConfig,

    /// Log level
    pub log_level: String,

    /// Log directory
    pub log_dir: String,
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// PiMMS server IPv4 address
    pub server_address: String,

    /// PiMMS server port (SYSTEM_PARAMETERS/iTcpIpPort on the server)
    pub server_port: u16,

    /// Local interface IP used by the trigger role
    pub trigger_address: String,

    /// Local interface IP per controller (train), in train order
    pub controller_addresses: Vec<String>,

    /// First local source port
    pub local_port_start: u16,

    /// Last local source port (inclusive)
    pub local_port_end: u16,

    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Write timeout in milliseconds
    pub write_timeout_ms: u64,

    /// Session identifier sent in log on messages
    pub session_id: String,

    /// Interval between trigger poll responses on a persistent link
    pub keepalive_interval_secs: u64,

    /// File that keeps the local port rotation between runs
    pub port_state_file: Option<PathBuf>,
}

/// Hot-folder layout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotFolderConfig {
    /// Folder polled by the PiMMS ingester
    pub base_path: PathBuf,

    /// Folder holding the canonical placeholder files
    pub source_path: PathBuf,

    /// Controller folder prefix, suffixed with the 1-based controller number
    pub controller_folder_prefix: String,

    /// Battery status placeholder file name (under `logs/`)
    pub battery_file: String,

    /// Output video file name expected by the ingester
    pub video_file: String,

    /// Output video metadata file name
    pub video_inf_file: String,

    /// Extension of captured videos dropped into camera folders
    pub capture_extension: String,

    /// Number of controllers (trains)
    pub controllers: u32,

    /// Number of camera rows per controller
    pub rows: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            hot_folders: HotFolderConfig::default(),
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "192.168.1.10".to_string(),
            server_port: DEFAULT_SERVER_PORT,
            trigger_address: "192.168.1.20".to_string(),
            controller_addresses: vec![
                "192.168.1.21".to_string(),
                "192.168.1.22".to_string(),
                "192.168.1.23".to_string(),
            ],
            local_port_start: DEFAULT_LOCAL_PORT_START,
            local_port_end: DEFAULT_LOCAL_PORT_END,
            connect_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            session_id: DEFAULT_SESSION_ID.to_string(),
            keepalive_interval_secs: 45,
            port_state_file: None,
        }
    }
}

impl Default for HotFolderConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("hotfolders"),
            source_path: PathBuf::from("source"),
            controller_folder_prefix: "controller".to_string(),
            battery_file: "battery.ini".to_string(),
            video_file: "clip0.mpg".to_string(),
            video_inf_file: "clip0.inf".to_string(),
            capture_extension: "mp4".to_string(),
            controllers: 3,
            rows: 1,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Parse configuration from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("invalid config: {}", e)))?;
        config.network.validate()?;
        Ok(config)
    }
}

impl NetworkConfig {
    /// Reject durations that would make every operation fail or spin
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(Error::config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    /// Validated server endpoint
    pub fn server_endpoint(&self) -> Result<ServerEndpoint> {
        ServerEndpoint::parse(&self.server_address, self.server_port)
    }

    /// Local interface IP for a 1-based controller number
    pub fn controller_address(&self, controller: usize) -> Option<&str> {
        controller
            .checked_sub(1)
            .and_then(|i| self.controller_addresses.get(i))
            .map(String::as_str)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Remote PiMMS server address, fixed for the lifetime of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEndpoint {
    host: Ipv4Addr,
    port: u16,
}

impl ServerEndpoint {
    /// Parse and validate an IPv4 host and port
    pub fn parse(host: &str, port: u16) -> Result<Self> {
        let host: Ipv4Addr = host
            .trim()
            .parse()
            .map_err(|_| Error::address(format!("invalid server address: {:?}", host)))?;
        if port == 0 {
            return Err(Error::address("server port must be non-zero"));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> Ipv4Addr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.server_port, 57343);
        assert_eq!(config.network.local_port_start, 12345);
        assert_eq!(config.network.keepalive_interval(), Duration::from_secs(45));
        assert_eq!(config.hot_folders.video_file, "clip0.mpg");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json(
            r#"{ "network": { "server_address": "10.0.0.5" }, "hot_folders": { "rows": 4 } }"#,
        )
        .unwrap();
        assert_eq!(config.network.server_address, "10.0.0.5");
        assert_eq!(config.network.server_port, 57343);
        assert_eq!(config.hot_folders.rows, 4);
        assert_eq!(config.hot_folders.battery_file, "battery.ini");
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = Config::from_json("{ nope").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        for field in [
            "connect_timeout_ms",
            "write_timeout_ms",
            "keepalive_interval_secs",
        ] {
            let json = format!(r#"{{ "network": {{ "{}": 0 }} }}"#, field);
            let err = Config::from_json(&json).unwrap_err();
            assert!(err.to_string().contains(field), "{}", err);
        }
        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_port_state_file_is_optional() {
        let config = Config::from_json(
            r#"{ "network": { "port_state_file": "/var/lib/pimms/ports.json" } }"#,
        )
        .unwrap();
        assert_eq!(
            config.network.port_state_file,
            Some(PathBuf::from("/var/lib/pimms/ports.json"))
        );
        assert!(Config::default().network.port_state_file.is_none());
    }

    #[test]
    fn test_server_endpoint_validation() {
        let endpoint = ServerEndpoint::parse("10.1.2.3", 57343).unwrap();
        assert_eq!(endpoint.to_string(), "10.1.2.3:57343");

        assert!(matches!(
            ServerEndpoint::parse("pimms.local", 57343),
            Err(Error::AddressConfig(_))
        ));
        assert!(matches!(
            ServerEndpoint::parse("10.1.2.3", 0),
            Err(Error::AddressConfig(_))
        ));
    }

    #[test]
    fn test_controller_address_is_one_based() {
        let network = NetworkConfig::default();
        assert_eq!(network.controller_address(1), Some("192.168.1.21"));
        assert_eq!(network.controller_address(0), None);
        assert_eq!(network.controller_address(4), None);
    }
}

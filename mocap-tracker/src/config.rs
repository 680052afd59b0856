//! Configuration for the stream client and tracker.
//!
//! Everything has a default matching a Motive server on the local machine,
//! so an empty JSON object is a valid configuration file.

use log::debug;
use mocap_core::protocol::natnet::{
    DEFAULT_COMMAND_PORT, DEFAULT_DATA_PORT, DEFAULT_MULTICAST_ADDR,
};
use mocap_core::{EngineConfig, KinematicsError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<KinematicsError> for ConfigError {
    fn from(e: KinematicsError) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

/// Receive loop diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiagnosticsConfig {
    /// Log every N-th frame per receive loop at debug level, 0 disables
    pub frame_log_interval: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        DiagnosticsConfig {
            frame_log_interval: 120,
        }
    }
}

/// Network parameters of the stream client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Address of the Motive server
    pub server_address: Ipv4Addr,
    /// Local interface used for the command socket and multicast membership
    pub local_address: Ipv4Addr,
    pub multicast_address: Ipv4Addr,
    pub command_port: u16,
    pub data_port: u16,
    pub use_multicast: bool,
    /// Receive timeout, bounds how long stop() waits for the loops
    pub read_timeout_ms: u64,
    /// Keep-alive period on unicast sessions
    pub keep_alive_interval_ms: u64,
    pub diagnostics: DiagnosticsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_address: Ipv4Addr::LOCALHOST,
            local_address: Ipv4Addr::LOCALHOST,
            multicast_address: DEFAULT_MULTICAST_ADDR,
            command_port: DEFAULT_COMMAND_PORT,
            data_port: DEFAULT_DATA_PORT,
            use_multicast: true,
            read_timeout_ms: 500,
            keep_alive_interval_ms: 1000,
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn command_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.server_address, self.command_port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "readTimeoutMs must be greater than 0".into(),
            ));
        }
        if self.use_multicast && !self.multicast_address.is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "{} is not a multicast address",
                self.multicast_address
            )));
        }
        Ok(())
    }
}

fn default_marker_set_label() -> Option<String> {
    Some("hand".to_string())
}

/// Complete tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    pub client: ClientConfig,
    pub engine: EngineConfig,
    /// Marker set persisted by the sink, `None` keeps every set
    #[serde(default = "default_marker_set_label")]
    pub marker_set_label: Option<String>,
    /// Frame file for the current trial
    pub data_file: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            client: ClientConfig::default(),
            engine: EngineConfig::default(),
            marker_set_label: default_marker_set_label(),
            data_file: None,
        }
    }
}

impl TrackerConfig {
    /// Read a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: TrackerConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.client.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

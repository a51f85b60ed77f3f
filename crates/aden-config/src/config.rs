//! Configuration structs with defaults and RON persistence.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the configuration inside the config directory.
pub const CONFIG_FILE_NAME: &str = "server.ron";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listening socket and connection limits.
    pub network: NetworkConfig,
    /// Wire format and per-session transforms.
    pub protocol: ProtocolConfig,
    /// Log level and log files.
    pub logging: LoggingConfig,
}

/// Listening socket and connection limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// IP address to bind. `::` binds dual-stack.
    pub bind_address: String,
    /// TCP port.
    pub port: u16,
    /// Live connections above which new clients are refused.
    pub max_connections: usize,
    /// Seconds without inbound data before a client is dropped (0 = never).
    pub idle_timeout_seconds: u64,
    /// Outbound frames each connection may queue.
    pub outbound_queue_capacity: usize,
    /// Disable Nagle's algorithm on client sockets.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive on client sockets.
    pub keepalive: bool,
    /// Listen backlog.
    pub backlog: u32,
    /// Consecutive accept failures before the listener gives up.
    pub max_consecutive_accept_errors: u32,
}

/// Wire format and per-session transforms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Protocol revision clients must announce in their handshake.
    pub protocol_version: u32,
    /// Largest accepted frame body in bytes.
    pub max_frame_len: usize,
    /// Whether the length prefix counts its own two bytes.
    pub length_includes_prefix: bool,
    /// Encrypt bodies once the handshake completes.
    pub encryption: bool,
    /// Compress large bodies once the handshake completes.
    pub compression: bool,
    /// Body size from which compression applies.
    pub compression_threshold: usize,
}

/// Log level and log files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directives (e.g. "info", "info,aden_net=debug"). `RUST_LOG` wins.
    pub level: String,
    /// Also write JSON logs to a file.
    pub file_logging: bool,
    /// Directory for log files. Defaults to `logs/` in the config directory.
    pub log_dir: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7777,
            max_connections: 1024,
            idle_timeout_seconds: 300,
            outbound_queue_capacity: 256,
            tcp_nodelay: true,
            keepalive: true,
            backlog: 1024,
            max_consecutive_accept_errors: 32,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            max_frame_len: 65533,
            length_includes_prefix: false,
            encryption: true,
            compression: false,
            compression_threshold: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging: false,
            log_dir: None,
        }
    }
}

impl NetworkConfig {
    /// The socket address to bind.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .trim_matches(|c| c == '[' || c == ']')
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// The idle timeout, or `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_seconds > 0).then(|| Duration::from_secs(self.idle_timeout_seconds))
    }
}

/// Platform configuration directory for the server, or the working directory
/// when the platform has none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("aden"))
        .unwrap_or_else(|| PathBuf::from("."))
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Where [`Config::open`] got its configuration from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// An existing file was read.
    Loaded,
    /// No file existed, so the defaults were written out.
    Created,
}

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let (config, source) = Self::open(config_dir)?;
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        match source {
            ConfigSource::Loaded => log::info!("Loaded config from {}", config_path.display()),
            ConfigSource::Created => {
                log::info!("Created default config at {}", config_path.display())
            }
        }
        Ok(config)
    }

    /// Like [`Config::load_or_create`] but reports the outcome to the caller
    /// instead of logging it, for use before logging is initialised.
    pub fn open(config_dir: &Path) -> Result<(Self, ConfigSource), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Ok((read_config(&config_path)?, ConfigSource::Loaded))
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            Ok((config, ConfigSource::Created))
        }
    }

    /// Save config to the given directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let write_error = |source| ConfigError::Write {
            path: config_path.clone(),
            source,
        };

        std::fs::create_dir_all(config_dir).map_err(write_error)?;
        let pretty = ron::ser::PrettyConfig::new().depth_limit(3);
        let serialized = ron::ser::to_string_pretty(self, pretty)?;
        std::fs::write(&config_path, serialized).map_err(write_error)
    }

    /// Re-read the file: `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = read_config(&config_dir.join(CONFIG_FILE_NAME))?;
        if new_config == *self {
            return Ok(None);
        }
        log::info!("Config file changed on disk");
        Ok(Some(new_config))
    }
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

//! Server configuration.
//!
//! Settings persist as a RON file (`server.ron`) in the configuration
//! directory. Missing fields fall back to their defaults and unknown fields are
//! ignored, so files written by older or newer builds keep loading. Command-line
//! flags override whatever the file says.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE_NAME, Config, ConfigSource, LoggingConfig, NetworkConfig, ProtocolConfig,
    default_config_dir,
};
pub use error::ConfigError;

//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Server command-line arguments.
///
/// Values given here override settings loaded from the config file.
#[derive(Parser, Debug, Default)]
#[command(name = "aden-server", about = "Multiplayer game server")]
pub struct CliArgs {
    /// IP address to bind.
    #[arg(long)]
    pub bind: Option<String>,

    /// TCP port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds of silence before a client is dropped (0 disables).
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Enable or disable session encryption.
    #[arg(long)]
    pub encryption: Option<bool>,

    /// Log filter (error, warn, info, debug, trace, or directives).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.network.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(max) = args.max_connections {
            self.network.max_connections = max;
        }
        if let Some(secs) = args.idle_timeout {
            self.network.idle_timeout_seconds = secs;
        }
        if let Some(encryption) = args.encryption {
            self.protocol.encryption = encryption;
        }
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            port: Some(2106),
            encryption: Some(false),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.port, 2106);
        assert!(!config.protocol.encryption);
        assert_eq!(config.logging.level, "debug");
        // Non-overridden fields retain defaults
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.network.max_connections, 1024);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::parse_from([
            "aden-server",
            "--port",
            "9014",
            "--bind",
            "::",
            "--config",
            "/etc/aden",
        ]);
        assert_eq!(args.port, Some(9014));
        assert_eq!(args.bind.as_deref(), Some("::"));
        assert_eq!(args.config, Some(PathBuf::from("/etc/aden")));
        assert_eq!(args.idle_timeout, None);
    }
}

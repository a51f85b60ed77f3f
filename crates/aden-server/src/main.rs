//! The Aden server binary: loads the configuration, starts the gate listener,
//! and serves until SIGINT or SIGTERM.

mod role;
mod signals;

use std::path::Path;
use std::sync::Arc;

use aden_config::{
    CONFIG_FILE_NAME, CliArgs, Config, ConfigError, ConfigSource, default_config_dir,
};
use aden_net::{CompressionConfig, FrameConfig, Listener, ListenerConfig, SocketConfig};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::role::GateOptions;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);

    let (mut config, source) = load_config(&config_dir);
    config.apply_cli_overrides(&args);

    aden_log::init_logging(&config.logging, &config_dir)?;
    report_config(&config_dir, source);

    let listener_config = listener_config(&config)?;
    let options = gate_options(&config);
    let listener = Listener::new(
        listener_config,
        Arc::new(role::registry()?),
        role::session_factory(&options),
        role::codec_factory(&options),
    );

    let cancel = CancellationToken::new();
    let serving = listener.start(cancel.clone())?;
    tracing::info!(
        protocol = options.protocol_version,
        encryption = options.encryption,
        compression = options.compression.is_some(),
        "Aden server started"
    );

    if let Err(e) = signals::shutdown_requested().await {
        tracing::error!("Failed to install signal handlers: {e}");
    }

    tracing::info!("Shutting down");
    cancel.cancel();
    serving.await?;
    tracing::info!("Server stopped");
    Ok(())
}

/// Read the config without logging, since logging depends on its contents.
fn load_config(config_dir: &Path) -> (Config, Result<ConfigSource, ConfigError>) {
    match Config::open(config_dir) {
        Ok((config, source)) => (config, Ok(source)),
        Err(e) => (Config::default(), Err(e)),
    }
}

fn report_config(config_dir: &Path, source: Result<ConfigSource, ConfigError>) {
    let path = config_dir.join(CONFIG_FILE_NAME);
    match source {
        Ok(ConfigSource::Loaded) => tracing::info!("Loaded config from {}", path.display()),
        Ok(ConfigSource::Created) => tracing::info!("Created default config at {}", path.display()),
        Err(e) => tracing::warn!("Failed to load config: {e}; falling back to defaults"),
    }
}

fn listener_config(config: &Config) -> Result<ListenerConfig, aden_config::ConfigError> {
    let network = &config.network;
    Ok(ListenerConfig {
        bind_addr: network.bind_addr()?,
        max_connections: network.max_connections,
        idle_timeout: network.idle_timeout(),
        outbound_queue_capacity: network.outbound_queue_capacity,
        socket: SocketConfig {
            tcp_nodelay: network.tcp_nodelay,
            keepalive_enabled: network.keepalive,
            backlog: network.backlog,
            ..Default::default()
        },
        max_consecutive_accept_errors: network.max_consecutive_accept_errors,
    })
}

fn gate_options(config: &Config) -> GateOptions {
    let protocol = &config.protocol;
    let frame = FrameConfig {
        max_frame_len: protocol.max_frame_len,
        length_includes_prefix: protocol.length_includes_prefix,
    };
    GateOptions {
        protocol_version: protocol.protocol_version,
        encryption: protocol.encryption,
        compression: protocol.compression.then(|| CompressionConfig {
            threshold: protocol.compression_threshold,
            enabled: true,
            max_decompressed_len: frame.max_body_len(),
        }),
        frame,
    }
}

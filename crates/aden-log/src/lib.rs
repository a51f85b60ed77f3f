//! Structured logging for the server.
//!
//! Sets up the `tracing` subscriber: console output with uptime timestamps and
//! targets, plus an optional JSON log file for post-mortem analysis. The filter
//! comes from the configured level unless `RUST_LOG` is set.

use std::fs::File;
use std::path::{Path, PathBuf};

use aden_config::LoggingConfig;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when the configured level does not parse.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file inside the log directory.
pub const LOG_FILE_NAME: &str = "aden-server.log";

/// Install the global tracing subscriber.
///
/// `config_dir` anchors the default log directory (`<config_dir>/logs`). A log
/// file that cannot be opened is reported on stderr and skipped; console
/// logging still starts.
///
/// # Examples
///
/// ```no_run
/// use aden_config::LoggingConfig;
///
/// let config = LoggingConfig::default();
/// aden_log::init_logging(&config, std::path::Path::new(".")).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig, config_dir: &Path) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_from_level(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let file_layer = log_file_path(config, config_dir).and_then(|path| {
        match json_file_layer(&path) {
            Ok(layer) => Some(layer),
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", path.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
}

/// Parse a filter string, falling back to [`DEFAULT_FILTER`].
pub fn filter_from_level(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Where the JSON log goes, or `None` when file logging is off.
pub fn log_file_path(config: &LoggingConfig, config_dir: &Path) -> Option<PathBuf> {
    if !config.file_logging {
        return None;
    }
    let dir = config
        .log_dir
        .clone()
        .unwrap_or_else(|| config_dir.join("logs"));
    Some(dir.join(LOG_FILE_NAME))
}

/// A layer appending one JSON object per event to `path`.
pub fn json_file_layer<S>(path: &Path) -> std::io::Result<impl Layer<S> + Send + Sync + use<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::options().create(true).append(true).open(path)?;

    Ok(fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .json())
}

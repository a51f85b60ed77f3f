//! Configuration error types.

use std::path::PathBuf;

/// Errors from loading, saving, or interpreting the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not a valid RON config.
    #[error("{} is not a valid config: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    #[error("cannot encode config as RON: {0}")]
    Serialize(#[from] ron::Error),

    /// `bind_address` is not an IP literal.
    #[error("{0:?} is not an IP address")]
    InvalidAddress(String),
}

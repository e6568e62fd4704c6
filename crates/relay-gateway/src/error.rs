//! Gateway error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failures loading a [`GatewayConfig`](crate::GatewayConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config has an empty token")]
    MissingToken,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Connecting or writing through the WebSocket failed.
    #[error("gateway connection: {0}")]
    Connection(#[from] relay_ws::Error),

    /// A payload could not be parsed or serialized.
    #[error("gateway payload: {0}")]
    Json(#[from] serde_json::Error),
}

//! Gateway session configuration, loadable from a JSON file.
//!
//! Only `token` is required:
//!
//! ```json
//! { "token": "...", "intents": 513 }
//! ```

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=9&encoding=json";

/// GUILDS | GUILD_MESSAGES.
pub const DEFAULT_INTENTS: u64 = 513;

/// Client metadata sent in Identify.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct GatewayConfig {
    pub token: String,
    #[serde(default = "default_intents")]
    pub intents: u64,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub properties: ConnectionProperties,
}

fn default_intents() -> u64 {
    DEFAULT_INTENTS
}

fn default_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            intents: DEFAULT_INTENTS,
            url: default_url(),
            properties: ConnectionProperties::default(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_intents(mut self, intents: u64) -> Self {
        self.intents = intents;
        self
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_json::from_str(text)?;
        if config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }
}

// The token is a credential; keep it out of logs.
impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("url", &self.url)
            .field("properties", &self.properties)
            .finish()
    }
}

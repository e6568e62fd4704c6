//! Gateway session client built on [`relay_ws`].
//!
//! Handles the session protocol spoken over the WebSocket: Identify on
//! Hello, a heartbeat task at the server's interval, sequence tracking and
//! routing of named dispatch events to a [`GatewayHandler`]. Reconnect and
//! resume policy is left to the caller; [`GatewayClient::last_sequence`] and
//! [`GatewayClient::session_id`] expose what a resume needs.
//!
//! ```no_run
//! use relay_gateway::{GatewayClient, GatewayConfig, GatewayHandler};
//! use serde_json::Value;
//!
//! struct Bot;
//!
//! impl GatewayHandler for Bot {
//!     fn on_ready(&self, _client: &GatewayClient, data: &Value) {
//!         println!("ready as {}", data["user"]["username"]);
//!     }
//! }
//!
//! let config = GatewayConfig::from_file("bot.json")?;
//! let client = GatewayClient::connect(config, Bot)?;
//! client.wait_closed(std::time::Duration::from_millis(100));
//! # Ok::<(), relay_gateway::GatewayError>(())
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod opcode;
pub mod payload;

pub use client::{GatewayClient, GatewayHandler};
pub use config::{ConnectionProperties, GatewayConfig, DEFAULT_GATEWAY_URL, DEFAULT_INTENTS};
pub use error::{ConfigError, GatewayError, Result};
pub use heartbeat::HeartbeatSchedule;
pub use opcode::GatewayOpcode;
pub use payload::{packet, GatewayEvent};

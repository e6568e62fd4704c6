//! Gateway payloads: `{"op": int, "d": any, "s": int|null, "t": string|null}`.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::opcode::GatewayOpcode;

/// One inbound gateway message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayEvent {
    /// Raw opcode; see [`opcode`](Self::opcode).
    #[serde(rename = "op")]
    pub op: u64,
    #[serde(rename = "s", default)]
    pub sequence: Option<u64>,
    #[serde(rename = "t", default)]
    pub event_name: Option<String>,
    #[serde(rename = "d", default)]
    pub data: Value,
}

impl GatewayEvent {
    pub fn parse(text: &str) -> Result<GatewayEvent> {
        Ok(serde_json::from_str(text)?)
    }

    /// `None` for opcodes this client does not know.
    pub fn opcode(&self) -> Option<GatewayOpcode> {
        GatewayOpcode::from_code(self.op)
    }

    /// Look up a value inside `d` by JSON pointer, e.g. `/heartbeat_interval`.
    pub fn data_at(&self, pointer: &str) -> Option<&Value> {
        self.data.pointer(pointer)
    }
}

/// Serialize an outbound `{op, d}` message.
pub fn packet(opcode: GatewayOpcode, data: Value) -> String {
    json!({ "op": opcode.code(), "d": data }).to_string()
}

/// The `d` of an Identify message.
pub fn identify_data(config: &GatewayConfig) -> Value {
    json!({
        "token": config.token,
        "intents": config.intents,
        "properties": {
            "os": config.properties.os,
            "browser": config.properties.browser,
            "device": config.properties.device,
        },
    })
}

/// The `d` of a Heartbeat: the last sequence, or `null`.
pub fn heartbeat_data(sequence: Option<u64>) -> Value {
    sequence.map_or(Value::Null, Value::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;

    #[test]
    fn test_parses_dispatch() {
        let event =
            GatewayEvent::parse(r#"{"op":0,"s":42,"t":"READY","d":{"session_id":"abc"}}"#).unwrap();
        assert_eq!(event.opcode(), Some(GatewayOpcode::Dispatch));
        assert_eq!(event.sequence, Some(42));
        assert_eq!(event.event_name.as_deref(), Some("READY"));
        assert_eq!(event.data_at("/session_id"), Some(&json!("abc")));
    }

    #[test]
    fn test_hello_without_sequence_fields() {
        let event = GatewayEvent::parse(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(event.opcode(), Some(GatewayOpcode::Hello));
        assert_eq!(event.sequence, None);
        assert_eq!(event.event_name, None);
        assert_eq!(
            event.data_at("/heartbeat_interval").and_then(Value::as_u64),
            Some(41250)
        );
    }

    #[test]
    fn test_explicit_nulls_and_unknown_opcode() {
        let event = GatewayEvent::parse(r#"{"op":5,"d":null,"s":null,"t":null}"#).unwrap();
        assert_eq!(event.opcode(), None);
        assert_eq!(event.data, Value::Null);
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(matches!(
            GatewayEvent::parse("not json"),
            Err(GatewayError::Json(_))
        ));
        assert!(GatewayEvent::parse(r#"{"d":{}}"#).is_err());
    }

    #[test]
    fn test_heartbeat_packets() {
        let null: Value = serde_json::from_str(&packet(GatewayOpcode::Heartbeat, heartbeat_data(None))).unwrap();
        assert_eq!(null, json!({"op": 1, "d": null}));
        let seq: Value = serde_json::from_str(&packet(GatewayOpcode::Heartbeat, heartbeat_data(Some(42)))).unwrap();
        assert_eq!(seq, json!({"op": 1, "d": 42}));
    }

    #[test]
    fn test_identify_carries_token_intents_and_properties() {
        let config = GatewayConfig::new("secret");
        let data = identify_data(&config);
        assert_eq!(data["token"], "secret");
        assert_eq!(data["intents"], 513);
        assert!(data["properties"]["os"].is_string());
        assert!(data["properties"]["browser"].is_string());
        assert!(data["properties"]["device"].is_string());
    }
}

// tl-protocol: Telemetry stream wire constants and frame classification.
//
// The server pushes JSON envelopes of the form `{"type": "...", "data": ...}`.
// Keepalive acknowledgements may also arrive as the bare text token `pong`.
// Only enough of the payload is inspected to tell control frames from data
// frames; the telemetry body itself is opaque to this crate.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

/// Outbound keepalive probe sent as a bare text frame.
pub const PROBE_LITERAL: &str = "ping";

/// Inbound keepalive acknowledgement sent as a bare text frame.
pub const ACK_LITERAL: &str = "pong";

/// Values of the envelope `type` discriminator.
pub mod message_types {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    /// Idle keepalive the server emits on its own when the client is quiet.
    pub const KEEPALIVE: &str = "keepalive";
    pub const TELEMETRY: &str = "telemetry";
}

/// WebSocket close codes the client distinguishes.
pub mod close_codes {
    /// Normal closure; never retried.
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    /// Close frame carried no status code.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Policy violation; the server uses it to reject bad credentials.
    pub const POLICY_VIOLATION: u16 = 1008;
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Tagged envelope used in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// An inbound payload as it came off the transport, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Bytes),
}

impl From<&str> for RawFrame {
    fn from(text: &str) -> Self {
        RawFrame::Text(text.to_owned())
    }
}

impl From<String> for RawFrame {
    fn from(text: String) -> Self {
        RawFrame::Text(text)
    }
}

impl From<Bytes> for RawFrame {
    fn from(bytes: Bytes) -> Self {
        RawFrame::Binary(bytes)
    }
}

impl From<Vec<u8>> for RawFrame {
    fn from(bytes: Vec<u8>) -> Self {
        RawFrame::Binary(Bytes::from(bytes))
    }
}

/// Classification of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    KeepaliveAck,
    /// Unwrapped telemetry body; the envelope is never exposed.
    TelemetryData(Value),
    Ignore,
}

/// How to treat a JSON value that carries no `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Non-empty objects and arrays are telemetry in their entirety.
    #[default]
    WholeValue,
    /// Only `{"type": "telemetry", "data": ...}` envelopes are telemetry.
    Strict,
}

/// Classify a raw inbound frame.
///
/// Binary frames are decoded as UTF-8 and then handled exactly like text, so
/// the transport encoding never changes the result. Anything that fails to
/// decode or parse is [`Frame::Ignore`].
pub fn decode(raw: &RawFrame, policy: FallbackPolicy) -> Frame {
    match raw {
        RawFrame::Text(text) => classify_text(text, policy),
        RawFrame::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => classify_text(text, policy),
            Err(_) => Frame::Ignore,
        },
    }
}

fn classify_text(text: &str, policy: FallbackPolicy) -> Frame {
    let text = text.trim();
    if text == ACK_LITERAL {
        return Frame::KeepaliveAck;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) => classify_value(value, policy),
        Err(_) => Frame::Ignore,
    }
}

fn classify_value(mut value: Value, policy: FallbackPolicy) -> Frame {
    let kind = match &value {
        Value::String(s) if s == ACK_LITERAL => return Frame::KeepaliveAck,
        Value::Object(map) => map.get("type").cloned(),
        _ => None,
    };

    match kind {
        Some(Value::String(kind)) => match kind.as_str() {
            message_types::PONG | message_types::KEEPALIVE => Frame::KeepaliveAck,
            message_types::TELEMETRY => {
                let data = value
                    .as_object_mut()
                    .and_then(|map| map.remove("data"))
                    .unwrap_or(Value::Null);
                if has_content(&data) {
                    Frame::TelemetryData(data)
                } else {
                    Frame::Ignore
                }
            }
            _ => Frame::Ignore,
        },
        Some(_) => Frame::Ignore,
        None => match policy {
            FallbackPolicy::WholeValue
                if (value.is_object() || value.is_array()) && has_content(&value) =>
            {
                Frame::TelemetryData(value)
            }
            _ => Frame::Ignore,
        },
    }
}

fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Outbound probes
// ---------------------------------------------------------------------------

/// Encoding used for the client's keepalive probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFormat {
    /// The 4-byte text `ping`.
    #[default]
    Literal,
    /// `{"type":"ping"}`.
    Envelope,
}

impl ProbeFormat {
    pub fn encode(self) -> String {
        match self {
            ProbeFormat::Literal => PROBE_LITERAL.to_owned(),
            ProbeFormat::Envelope => format!(r#"{{"type":"{}"}}"#, message_types::PING),
        }
    }
}

/// Server side: does this text frame carry a keepalive probe in either format?
pub fn is_probe(text: &str) -> bool {
    let text = text.trim();
    if text == PROBE_LITERAL {
        return true;
    }
    serde_json::from_str::<Envelope>(text).is_ok_and(|env| env.kind == message_types::PING)
}

/// Server side: wrap a telemetry body in its envelope.
pub fn telemetry_frame(data: Value) -> String {
    serde_json::json!({ "type": message_types::TELEMETRY, "data": data }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_probe_is_minimal_json() {
        assert_eq!(ProbeFormat::Envelope.encode(), r#"{"type":"ping"}"#);
        assert_eq!(ProbeFormat::Literal.encode().len(), 4);
    }

    #[test]
    fn both_probe_formats_are_recognised_server_side() {
        assert!(is_probe(&ProbeFormat::Literal.encode()));
        assert!(is_probe(&ProbeFormat::Envelope.encode()));
        assert!(!is_probe("pong"));
        assert!(!is_probe(r#"{"type":"telemetry"}"#));
    }

    #[test]
    fn telemetry_frame_wraps_body() {
        let text = telemetry_frame(json!({"alt": 12.5}));
        let env: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(env.kind, "telemetry");
        assert_eq!(env.data, Some(json!({"alt": 12.5})));
    }

    #[test]
    fn scalar_without_discriminator_is_not_telemetry() {
        assert_eq!(
            decode(&RawFrame::from("42"), FallbackPolicy::WholeValue),
            Frame::Ignore
        );
        assert_eq!(
            decode(&RawFrame::from(r#""hello""#), FallbackPolicy::WholeValue),
            Frame::Ignore
        );
    }

    #[test]
    fn json_string_pong_is_an_ack() {
        assert_eq!(
            decode(&RawFrame::from(r#""pong""#), FallbackPolicy::Strict),
            Frame::KeepaliveAck
        );
    }
}

//! Channel wire messages and recorded events.
//!
//! The protocol is schema-light by design: every message carries an
//! `event_type` plus free-form payload fields, and task-specific observation
//! scripts define their own event vocabulary. The core only interprets the
//! handful of reserved types below; everything else is passed through
//! verbatim to the [`ResultCollector`](crate::collector::ResultCollector).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::SessionId;

/// Reserved event types interpreted by the core.
pub mod reserved {
    /// Script → evaluator: first message on a physical connection, carries
    /// `session_id` to bind the transport to a logical session.
    pub const HELLO: &str = "hello";
    /// Evaluator → script: carries `content` with the observation source.
    pub const INJECT: &str = "inject";
    /// Script → evaluator: observation logic finished initializing. Latched
    /// as the session's ready signal, never forwarded to the collector.
    pub const START_SUCCESS: &str = "start_success";
    /// Evaluator → script: capture and report final state now.
    pub const EVALUATE: &str = "evaluate";
    /// Script → evaluator: final-state capture finished.
    pub const EVALUATE_ON_COMPLETION: &str = "evaluate_on_completion";
    /// Evaluator → script: best-effort teardown notice.
    pub const UNLOAD: &str = "unload";
}

/// A single wire message, in either direction.
///
/// Serialized as one JSON object per line. Unknown fields are preserved in
/// `payload` via serde flattening.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelMessage {
    /// Message classification; reserved values listed in [`reserved`].
    pub event_type: String,

    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Task-specific fields (`content`, `path`, `data`, ...).
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

impl ChannelMessage {
    /// Create a message with an empty payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            message: String::new(),
            payload: serde_json::Map::new(),
        }
    }

    /// Attach a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// The `hello` handshake for a session.
    pub fn hello(session_id: &SessionId) -> Self {
        Self::new(reserved::HELLO)
            .with_field("session_id", Value::String(session_id.to_string()))
    }

    /// The `inject` command carrying observation-script source.
    pub fn inject(source: &str) -> Self {
        Self::new(reserved::INJECT).with_field("content", Value::String(source.to_string()))
    }

    /// The `evaluate` command (no payload required).
    pub fn evaluate() -> Self {
        Self::new(reserved::EVALUATE)
    }

    /// The `unload` teardown notice.
    pub fn unload() -> Self {
        Self::new(reserved::UNLOAD)
    }

    /// Read a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Read a payload field as a string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// An immutable event as recorded by the collector.
///
/// `seq` is assigned at receipt and defines the snapshot order; it reflects
/// receipt order, not necessarily emission order inside the target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Which session this event belongs to.
    pub session_id: SessionId,

    /// Monotonically increasing receipt sequence within the session.
    pub seq: u64,

    /// When the evaluator received the event.
    pub received_at: DateTime<Utc>,

    /// Event classification (opaque to the core).
    pub event_type: String,

    /// Optional human-readable description.
    pub message: String,

    /// Task-specific payload fields.
    pub payload: serde_json::Map<String, Value>,
}

impl Event {
    /// Read a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Read a payload field as a string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serde_roundtrip_with_payload() {
        let msg = ChannelMessage::new("open_file")
            .with_field("path", Value::String("/tmp/notes.txt".into()));

        let json = serde_json::to_string(&msg).expect("serialize");
        let back: ChannelMessage = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(msg, back);
        assert_eq!(back.field_str("path"), Some("/tmp/notes.txt"));
    }

    #[test]
    fn test_message_flattens_unknown_fields() {
        let json = r#"{"event_type":"command_executed","message":"ran build","data":{"code":0},"breakpoints":[12,40]}"#;
        let msg: ChannelMessage = serde_json::from_str(json).expect("deserialize");

        assert_eq!(msg.event_type, "command_executed");
        assert_eq!(msg.message, "ran build");
        assert!(msg.field("data").is_some());
        assert!(msg.field("breakpoints").is_some());
    }

    #[test]
    fn test_evaluate_has_no_payload() {
        let msg = ChannelMessage::evaluate();
        let json = serde_json::to_string(&msg).expect("serialize");
        assert_eq!(json, r#"{"event_type":"evaluate"}"#);
    }

    #[test]
    fn test_hello_carries_session_id() {
        let id = SessionId::from("s-42");
        let msg = ChannelMessage::hello(&id);
        assert_eq!(msg.event_type, reserved::HELLO);
        assert_eq!(msg.field_str("session_id"), Some("s-42"));
    }
}

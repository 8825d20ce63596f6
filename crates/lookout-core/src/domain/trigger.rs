//! Self-terminating trigger patterns.
//!
//! A trigger pattern declares the event shape that signals the agent has
//! reached a decidable state. Patterns are equality-based: an event type plus
//! zero or more payload field comparisons, all of which must hold.
//!
//! Task files may spell patterns as expression strings, e.g.
//! `event_type == 'open_file' && path == '/tmp/x.txt'`.

use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::Event;

/// An event pattern that initiates final evaluation when matched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerPattern {
    /// Required `event_type` of the matching event.
    pub event_type: String,

    /// Payload fields that must be string-equal on the matching event.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, Value>,
}

impl TriggerPattern {
    /// Match on event type alone.
    pub fn event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Require a payload field to equal the given value.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Whether the event satisfies every clause of this pattern.
    pub fn matches(&self, event: &Event) -> bool {
        if event.event_type != self.event_type {
            return false;
        }
        self.fields
            .iter()
            .all(|(key, expected)| event.payload.get(key) == Some(expected))
    }
}

fn clause_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*==\s*'([^']*)'\s*$")
            .expect("clause regex is valid")
    })
}

/// Error parsing a trigger expression string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TriggerParseError {
    #[error("invalid trigger clause: {0:?} (expected `field == 'value'`)")]
    InvalidClause(String),

    #[error("trigger expression must constrain event_type")]
    MissingEventType,
}

impl FromStr for TriggerPattern {
    type Err = TriggerParseError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let mut event_type = None;
        let mut fields = serde_json::Map::new();

        for clause in expr.split("&&") {
            let caps = clause_re()
                .captures(clause)
                .ok_or_else(|| TriggerParseError::InvalidClause(clause.trim().to_string()))?;
            let key = &caps[1];
            let value = caps[2].to_string();
            if key == "event_type" {
                event_type = Some(value);
            } else {
                fields.insert(key.to_string(), Value::String(value));
            }
        }

        Ok(Self {
            event_type: event_type.ok_or(TriggerParseError::MissingEventType)?,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::SessionId;
    use chrono::Utc;

    fn event(event_type: &str, payload: serde_json::Map<String, Value>) -> Event {
        Event {
            session_id: SessionId::from("s-1"),
            seq: 1,
            received_at: Utc::now(),
            event_type: event_type.to_string(),
            message: String::new(),
            payload,
        }
    }

    #[test]
    fn test_parse_event_type_only() {
        let pattern: TriggerPattern = "event_type == 'open_file'".parse().unwrap();
        assert_eq!(pattern, TriggerPattern::event_type("open_file"));
    }

    #[test]
    fn test_parse_with_field_clause() {
        let pattern: TriggerPattern = "event_type == 'open_file' && path == '/tmp/x.txt'"
            .parse()
            .unwrap();
        assert_eq!(pattern.event_type, "open_file");
        assert_eq!(
            pattern.fields.get("path"),
            Some(&Value::String("/tmp/x.txt".into()))
        );
    }

    #[test]
    fn test_parse_rejects_missing_event_type() {
        let err = "path == '/tmp/x.txt'".parse::<TriggerPattern>().unwrap_err();
        assert_eq!(err, TriggerParseError::MissingEventType);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = "event_type contains 'x'".parse::<TriggerPattern>().unwrap_err();
        assert!(matches!(err, TriggerParseError::InvalidClause(_)));
    }

    #[test]
    fn test_matches_event_type() {
        let pattern = TriggerPattern::event_type("open_file");
        assert!(pattern.matches(&event("open_file", serde_json::Map::new())));
        assert!(!pattern.matches(&event("create_terminal", serde_json::Map::new())));
    }

    #[test]
    fn test_matches_requires_all_fields() {
        let pattern = TriggerPattern::event_type("open_file")
            .with_field("path", Value::String("/tmp/x.txt".into()));

        let mut payload = serde_json::Map::new();
        payload.insert("path".into(), Value::String("/tmp/x.txt".into()));
        assert!(pattern.matches(&event("open_file", payload)));

        let mut wrong = serde_json::Map::new();
        wrong.insert("path".into(), Value::String("/tmp/other.txt".into()));
        assert!(!pattern.matches(&event("open_file", wrong)));

        assert!(!pattern.matches(&event("open_file", serde_json::Map::new())));
    }
}

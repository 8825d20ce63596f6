//! Session identity and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one evaluation run, stable across transport reconnects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an evaluation session.
///
/// `Completed`, `Failed` and `TimedOut` are terminal; `Failed` and `TimedOut`
/// are reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Armed,
    Monitoring,
    EvaluationRequested,
    Completed,
    Failed,
    TimedOut,
}

impl SessionState {
    /// Whether this state ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::TimedOut
        )
    }
}

/// One evaluation run binding a task to a target process and a channel
/// connection. Owned exclusively by the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Unique identifier, also the channel's logical connection id.
    pub session_id: SessionId,

    /// Which task this session evaluates.
    pub task_id: String,

    /// Current lifecycle state.
    pub state: SessionState,

    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session in `Created` state.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            session_id: SessionId::generate(),
            task_id: task_id.into(),
            state: SessionState::Created,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::TimedOut.is_terminal());
        assert!(!SessionState::Created.is_terminal());
        assert!(!SessionState::Monitoring.is_terminal());
        assert!(!SessionState::EvaluationRequested.is_terminal());
    }

    #[test]
    fn test_session_new_defaults() {
        let session = Session::new("task01_search");
        assert_eq!(session.state, SessionState::Created);
        assert_eq!(session.task_id, "task01_search");
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_state_serde_snake_case() {
        let json = serde_json::to_string(&SessionState::EvaluationRequested).unwrap();
        assert_eq!(json, r#""evaluation_requested""#);
    }
}

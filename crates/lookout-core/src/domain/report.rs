//! Verdicts and the per-session Report artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::Event;
use super::session::{SessionId, SessionState};

/// Outcome of a task-supplied verdict function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    /// Whether the task is judged successful.
    pub passed: bool,

    /// Free-form supporting evidence (matched events, extracted values, ...).
    pub evidence: serde_json::Value,
}

impl Verdict {
    pub fn pass(evidence: serde_json::Value) -> Self {
        Self {
            passed: true,
            evidence,
        }
    }

    pub fn fail(evidence: serde_json::Value) -> Self {
        Self {
            passed: false,
            evidence,
        }
    }
}

/// Why a session reached its terminal state.
///
/// For `Completed` sessions this records which condition initiated the final
/// evaluation, making the trigger-vs-evaluate-now precedence observable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// A task-defined trigger pattern matched the event stream.
    TriggerMatched,
    /// An external evaluate-now signal arrived.
    EvaluateNow,
    /// The coarse wall-clock budget expired before evaluation was requested.
    Timeout,
    /// The hook manager could not attach to the target.
    AttachFailed,
    /// The observation script failed to initialize.
    ScriptLoadFailed,
    /// The channel dropped with no recovery.
    ChannelLost,
    /// The task-supplied verdict function returned an error.
    VerdictFailed,
    /// External cancellation (operator abort).
    Cancelled,
}

/// Immutable summary of one evaluation session.
///
/// Exactly one Report is produced per session, whichever terminal state is
/// reached — "no report" is itself a bug.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    /// Which task was evaluated.
    pub task_id: String,

    /// Which session produced this report.
    pub session_id: SessionId,

    /// Terminal lifecycle state (`Completed`, `Failed` or `TimedOut`).
    pub state: SessionState,

    /// Why the terminal state was reached.
    pub reason: ReasonCode,

    /// The verdict, when one was computed.
    pub verdict: Option<Verdict>,

    /// Whether the grace window elapsed before the script's terminal event
    /// (the verdict was computed over a degraded snapshot).
    pub grace_elapsed: bool,

    /// Full event timeline, in receipt order.
    pub events: Vec<Event>,

    /// When the session started.
    pub started_at: DateTime<Utc>,

    /// When the session reached its terminal state.
    pub finished_at: DateTime<Utc>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,

    /// Captured error for `Failed` sessions.
    pub error: Option<String>,
}

impl Report {
    /// Whether the session both completed and passed its verdict.
    pub fn passed(&self) -> bool {
        self.state == SessionState::Completed
            && self.verdict.as_ref().is_some_and(|v| v.passed)
    }
}

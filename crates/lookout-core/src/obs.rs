//! Structured observability hooks for session lifecycle events.
//!
//! This module provides:
//! - Session-scoped tracing spans via [`session_span`]
//! - Emission functions for key lifecycle events: state transitions,
//!   event receipt, report production, cleanup failures
//!
//! Events are emitted at `info!` level (configurable via the `LOOKOUT_LOG`
//! env var). JSON output is selected at subscriber setup, see
//! [`init_tracing`](crate::telemetry::init_tracing).

use tracing::info;

use crate::domain::{ReasonCode, SessionState};

/// Span tagged with the session id, covering one session's whole lifecycle.
///
/// Attach it to the session future with [`tracing::Instrument`] so the span
/// follows the future across worker threads; an entered guard must never be
/// held across an `.await`.
///
/// # Example
///
/// ```ignore
/// use tracing::Instrument;
/// drive_session().instrument(session_span("sess-12345")).await;
/// ```
pub fn session_span(session_id: &str) -> tracing::Span {
    tracing::info_span!("lookout.session", session_id = %session_id)
}

/// Emit event: session started for a task.
pub fn emit_session_started(session_id: &str, task_id: &str) {
    info!(event = "session.started", session_id = %session_id, task_id = %task_id);
}

/// Emit event: state machine transition.
pub fn emit_state_transition(session_id: &str, from: SessionState, to: SessionState) {
    info!(event = "session.transition", session_id = %session_id, from = ?from, to = ?to);
}

/// Emit event: a behavioral event was recorded for the session.
pub fn emit_event_recorded(session_id: &str, event_type: &str, seq: u64) {
    info!(event = "session.event_recorded", session_id = %session_id, kind = %event_type, seq = seq);
}

/// Emit event: report produced with terminal state and reason.
pub fn emit_report_produced(
    session_id: &str,
    state: SessionState,
    reason: ReasonCode,
    duration_ms: u64,
) {
    info!(
        event = "session.report",
        session_id = %session_id,
        state = ?state,
        reason = ?reason,
        duration_ms = duration_ms,
    );
}

/// Emit event: teardown error (warning level; cleanup never propagates).
pub fn emit_cleanup_error(session_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "session.cleanup_error", session_id = %session_id, error = %error);
}

//! Append-only per-session event store.
//!
//! One logical partition per session. `record` serializes concurrent appends;
//! `snapshot` is a consistent point-in-time read that never observes a
//! partially-appended event. Storage problems are logged and swallowed —
//! event loss is preferred over crashing an evaluation.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::domain::{ChannelMessage, Event, SessionId};
use crate::metrics::METRICS;
use crate::obs;

struct SessionStore {
    events: RwLock<Vec<Event>>,
}

impl SessionStore {
    fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }
}

/// Thread-safe append-only store of received events, partitioned by session.
#[derive(Default)]
pub struct ResultCollector {
    sessions: DashMap<SessionId, Arc<SessionStore>>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the partition for a session. Idempotent.
    pub fn bind_session(&self, session_id: &SessionId) {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionStore::new()));
    }

    /// Append a received message as an [`Event`], assigning its receipt
    /// sequence number. Returns the recorded event so callers can match
    /// trigger patterns against it without re-reading the store.
    pub fn record(
        &self,
        session_id: &SessionId,
        message: ChannelMessage,
        received_at: DateTime<Utc>,
    ) -> Event {
        let store = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionStore::new()))
            .clone();

        // Sequence assignment and append happen under one write guard so a
        // snapshot can never observe seq numbers out of receipt order.
        let mut events = match store.events.write() {
            Ok(events) => events,
            // A poisoned lock means a panic while appending; keep serving
            // the surviving data rather than failing the evaluation.
            Err(poisoned) => poisoned.into_inner(),
        };
        let seq = events.len() as u64 + 1;
        let event = Event {
            session_id: session_id.clone(),
            seq,
            received_at,
            event_type: message.event_type,
            message: message.message,
            payload: message.payload,
        };
        events.push(event.clone());
        drop(events);

        METRICS.inc_events_recorded();
        obs::emit_event_recorded(session_id.as_str(), &event.event_type, seq);
        event
    }

    /// All events recorded so far for the session, in receipt order.
    pub fn snapshot(&self, session_id: &SessionId) -> Vec<Event> {
        let Some(store) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return Vec::new();
        };
        // The guard must be a local so it drops before `store` does.
        let events = match store.events.read() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.clone()
    }

    /// Events matching a predicate, in receipt order. Convenience query for
    /// verdict functions.
    pub fn filter<P>(&self, session_id: &SessionId, predicate: P) -> Vec<Event>
    where
        P: Fn(&Event) -> bool,
    {
        self.snapshot(session_id)
            .into_iter()
            .filter(|e| predicate(e))
            .collect()
    }

    /// Drop the session's partition once its report has been produced.
    pub fn remove_session(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }
}

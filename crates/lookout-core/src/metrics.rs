//! Global atomic counters for Lookout observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a session).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters — no allocations, no locking.
pub struct Metrics {
    events_recorded: AtomicU64,
    sessions_completed: AtomicU64,
    reconnects: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_recorded: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Increment the events-recorded counter by one.
    pub fn inc_events_recorded(&self) {
        self.events_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the sessions-completed counter by one.
    pub fn inc_sessions_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the transport-reconnect counter by one.
    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a session) rather than on
    /// every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_recorded = self.events_recorded(),
            sessions_completed = self.sessions_completed(),
            reconnects = self.reconnects(),
        );
    }

    /// Read the current events-recorded count.
    pub fn events_recorded(&self) -> u64 {
        self.events_recorded.load(Ordering::Relaxed)
    }

    /// Read the current sessions-completed count.
    pub fn sessions_completed(&self) -> u64 {
        self.sessions_completed.load(Ordering::Relaxed)
    }

    /// Read the current reconnect count.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

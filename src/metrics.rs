//! Internal-only process counters (A4). Nothing here is exposed over
//! HTTP; periodic reap tasks and request handlers fetch-add into these and
//! `tracing` spans carry the rest. Grounded in the teacher's
//! `AtomicU64`-per-counter style (`models/connection.rs`).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineMetrics {
    requests_total: AtomicU64,
    requests_denied: AtomicU64,
    sessions_created: AtomicU64,
    sessions_expired: AtomicU64,
    captures_recorded: AtomicU64,
    events_emitted: AtomicU64,
    fingerprints_reaped: AtomicU64,
    rate_limited_total: AtomicU64,
    tls_handshake_failures: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) -> u64 {
        self.requests_total.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_denied(&self) {
        self.requests_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sessions_expired(&self, n: u64) {
        self.sessions_expired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_capture(&self) {
        self.captures_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_emitted(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fingerprints_reaped(&self, n: u64) {
        self.fingerprints_reaped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tls_handshake_failure(&self) {
        self.tls_handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_denied: self.requests_denied.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            captures_recorded: self.captures_recorded.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            fingerprints_reaped: self.fingerprints_reaped.load(Ordering::Relaxed),
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
            tls_handshake_failures: self.tls_handshake_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time read, logged at intervals via `tracing` rather than
/// served over any endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EngineMetricsSnapshot {
    pub requests_total: u64,
    pub requests_denied: u64,
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub captures_recorded: u64,
    pub events_emitted: u64,
    pub fingerprints_reaped: u64,
    pub rate_limited_total: u64,
    pub tls_handshake_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.record_request(), 1);
        assert_eq!(metrics.record_request(), 2);
        metrics.record_denied();
        metrics.record_session_created();
        metrics.record_capture();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.requests_denied, 1);
        assert_eq!(snap.sessions_created, 1);
        assert_eq!(snap.captures_recorded, 1);
    }
}

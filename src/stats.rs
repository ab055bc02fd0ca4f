//! Server-wide counters.
//!
//! Every counter is a relaxed atomic: the values are for observation only
//! and never gate control flow.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    active: AtomicU64,
    refused: AtomicU64,
    decoded: AtomicU64,
    malformed: AtomicU64,
    dispatched: AtomicU64,
    rejected: AtomicU64,
    written: AtomicU64,
    discarded: AtomicU64,
    render_failures: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections accepted since start
    pub accepted: u64,
    /// Connections currently open
    pub active: u64,
    /// Connections dropped at accept because of `max_connections`
    pub refused: u64,
    /// Requests decoded
    pub decoded: u64,
    /// Connections closed for malformed input
    pub malformed: u64,
    /// Requests pushed to the dispatch queue
    pub dispatched: u64,
    /// Requests answered with "server busy"
    pub rejected: u64,
    /// Responses queued on a live connection
    pub written: u64,
    /// Results dropped because their connection was gone
    pub discarded: u64,
    /// Results carrying a render error
    pub render_failures: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // saturating so an unbalanced close can never wrap
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn connection_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_decoded(&self) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_input(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn result_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_failed(&self) {
        self.render_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            render_failures: self.render_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.active, 1);
    }

    #[test]
    fn test_active_never_underflows() {
        let stats = ServerStats::new();
        stats.connection_closed();
        assert_eq!(stats.active_connections(), 0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let stats = ServerStats::new();
        stats.request_decoded();
        let before = stats.snapshot();
        stats.request_decoded();
        assert_eq!(before.decoded, 1);
        assert_eq!(stats.snapshot().decoded, 2);
    }
}

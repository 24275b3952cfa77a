//! Admission counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of admission counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
    /// Connections checked against the blacklist.
    pub connections_checked: u64,
    /// Connections rejected because their IP was blacklisted.
    pub connections_rejected: u64,
    /// Connection events dropped because the bookkeeping queue was full.
    pub connect_events_dropped: u64,
    /// Success events dropped because the bookkeeping queue was full.
    pub success_events_dropped: u64,
    /// Idle connections detected by the sweep.
    pub idle_failures: u64,
    /// IPs added to the blacklist.
    pub ips_blacklisted: u64,
    /// IPs removed from the blacklist after expiring.
    pub ips_expired: u64,
}

/// Thread-safe admission counters shared between callers and the bookkeeping task.
#[derive(Default)]
pub struct AdmissionMetrics {
    connections_checked: AtomicU64,
    connections_rejected: AtomicU64,
    connect_events_dropped: AtomicU64,
    success_events_dropped: AtomicU64,
    idle_failures: AtomicU64,
    ips_blacklisted: AtomicU64,
    ips_expired: AtomicU64,
}

impl std::fmt::Debug for AdmissionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl AdmissionMetrics {
    /// Creates a metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one admission check.
    pub fn record_check(&self, rejected: bool) {
        self.connections_checked.fetch_add(1, Ordering::Relaxed);
        if rejected {
            self.connections_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn inc_connect_dropped(&self) {
        self.connect_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_success_dropped(&self) {
        self.success_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_idle_failures(&self, n: u64) {
        self.idle_failures.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_blacklisted(&self, n: u64) {
        self.ips_blacklisted.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_expired(&self, n: u64) {
        self.ips_expired.fetch_add(n, Ordering::Relaxed);
    }

    /// Takes a snapshot of all counters.
    pub fn snapshot(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            connections_checked: self.connections_checked.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connect_events_dropped: self.connect_events_dropped.load(Ordering::Relaxed),
            success_events_dropped: self.success_events_dropped.load(Ordering::Relaxed),
            idle_failures: self.idle_failures.load(Ordering::Relaxed),
            ips_blacklisted: self.ips_blacklisted.load(Ordering::Relaxed),
            ips_expired: self.ips_expired.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_zero() {
        let metrics = AdmissionMetrics::new();
        assert_eq!(metrics.snapshot(), AdmissionSnapshot::default());
    }

    #[test]
    fn test_record_check() {
        let metrics = AdmissionMetrics::new();
        metrics.record_check(false);
        metrics.record_check(true);
        metrics.record_check(false);
        let snap = metrics.snapshot();
        assert_eq!(snap.connections_checked, 3);
        assert_eq!(snap.connections_rejected, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = AdmissionMetrics::new();
        metrics.inc_connect_dropped();
        metrics.add_blacklisted(2);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["connect_events_dropped"], 1);
        assert_eq!(json["ips_blacklisted"], 2);
    }
}

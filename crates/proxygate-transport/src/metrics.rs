//! Throttle counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of throttle counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleSnapshot {
    /// Connections moved from unthrottled to throttled.
    pub throttle_enables: u64,
    /// Connections moved from throttled back to unthrottled.
    pub throttle_disables: u64,
    /// Connections permanently exempted from throttling.
    pub throttle_locks: u64,
    /// Throttle control messages with a payload that was not understood.
    pub unhandled_payloads: u64,
}

/// Thread-safe throttle counters, usually shared by every connection of a listener.
#[derive(Default)]
pub struct ThrottleMetrics {
    throttle_enables: AtomicU64,
    throttle_disables: AtomicU64,
    throttle_locks: AtomicU64,
    unhandled_payloads: AtomicU64,
}

impl std::fmt::Debug for ThrottleMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ThrottleMetrics {
    /// Creates a metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_enables(&self) {
        self.throttle_enables.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_disables(&self) {
        self.throttle_disables.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_locks(&self) {
        self.throttle_locks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_unhandled(&self) {
        self.unhandled_payloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of all counters.
    pub fn snapshot(&self) -> ThrottleSnapshot {
        ThrottleSnapshot {
            throttle_enables: self.throttle_enables.load(Ordering::Relaxed),
            throttle_disables: self.throttle_disables.load(Ordering::Relaxed),
            throttle_locks: self.throttle_locks.load(Ordering::Relaxed),
            unhandled_payloads: self.unhandled_payloads.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ThrottleMetrics::new();
        assert_eq!(metrics.snapshot(), ThrottleSnapshot::default());
        metrics.inc_enables();
        metrics.inc_enables();
        metrics.inc_locks();
        metrics.inc_unhandled();
        let snap = metrics.snapshot();
        assert_eq!(snap.throttle_enables, 2);
        assert_eq!(snap.throttle_locks, 1);
        assert_eq!(snap.throttle_disables, 0);
        assert_eq!(snap.unhandled_payloads, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ThrottleMetrics::new();
        metrics.inc_disables();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["throttle_disables"], 1);
    }
}

//! Per-IP failure streak bookkeeping.
//!
//! Owned exclusively by the blacklist's bookkeeping task, so nothing here is
//! synchronized. Every method takes the current instant explicitly.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Failure history for one source IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRecord {
    /// Start of the current streak of connections without a valid request.
    pub first_failure_at: Option<Instant>,
    /// Most recent connection attempt.
    pub last_connect_at: Instant,
    /// Idle timeouts counted in the current streak.
    pub consecutive_failures: u32,
}

/// Outcome of one idle sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdleSweep {
    /// IPs that were counted as failed in this sweep.
    pub failures: usize,
    /// IPs whose failure count reached the limit in this sweep.
    pub blacklisted: Vec<IpAddr>,
}

/// Tracks connection streaks and idle failures for every recently seen IP.
#[derive(Debug)]
pub struct FailureTracker {
    max_idle_time: Duration,
    max_connect_interval: Duration,
    allowed_failures: u32,
    records: HashMap<IpAddr, IpRecord>,
}

impl FailureTracker {
    /// Creates an empty tracker.
    pub fn new(max_idle_time: Duration, max_connect_interval: Duration, allowed_failures: u32) -> Self {
        Self {
            max_idle_time,
            max_connect_interval,
            allowed_failures,
            records: HashMap::new(),
        }
    }

    /// Records a connection attempt from `ip`.
    ///
    /// An attempt arriving more than `max_connect_interval` after the previous
    /// one (or the first attempt ever seen) starts over with a zero failure
    /// count and does not open a streak. Otherwise the streak start is
    /// recorded unless one is already pending.
    pub fn on_connection(&mut self, ip: IpAddr, now: Instant) {
        let record = match self.records.entry(ip) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(IpRecord {
                    first_failure_at: None,
                    last_connect_at: now,
                    consecutive_failures: 0,
                });
                return;
            }
        };

        let gap = now.saturating_duration_since(record.last_connect_at);
        record.last_connect_at = now;
        if gap > self.max_connect_interval {
            record.consecutive_failures = 0;
            return;
        }
        record.first_failure_at.get_or_insert(now);
    }

    /// Clears all failure state for `ip`.
    pub fn on_success(&mut self, ip: IpAddr) {
        self.records.remove(&ip);
    }

    /// Counts a failure for every IP whose streak has been idle longer than
    /// `max_idle_time` and reports the IPs that crossed `allowed_failures`.
    ///
    /// Reported IPs are dropped from tracking: from here on the blacklist set
    /// decides about them, and a connection event still in flight starts a
    /// fresh record instead of re-reporting a saturated one.
    pub fn check_for_idlers(&mut self, now: Instant) -> IdleSweep {
        let mut sweep = IdleSweep::default();
        for (ip, record) in self.records.iter_mut() {
            let Some(started) = record.first_failure_at else {
                continue;
            };
            if now.saturating_duration_since(started) <= self.max_idle_time {
                continue;
            }
            debug!(
                client_ip = %ip,
                max_idle_ms = self.max_idle_time.as_millis() as u64,
                "connected but failed to send a valid request in time"
            );
            record.first_failure_at = None;
            record.consecutive_failures += 1;
            sweep.failures += 1;
            if record.consecutive_failures >= self.allowed_failures {
                sweep.blacklisted.push(*ip);
            }
        }
        for ip in &sweep.blacklisted {
            self.records.remove(ip);
        }
        sweep
    }

    /// Drops records that can no longer influence a decision: no pending
    /// streak and a last attempt older than `max_connect_interval`, which
    /// means the next attempt resets the count anyway.
    pub fn prune_stale(&mut self, now: Instant) -> usize {
        let before = self.records.len();
        let max_connect_interval = self.max_connect_interval;
        self.records.retain(|_, record| {
            record.first_failure_at.is_some()
                || now.saturating_duration_since(record.last_connect_at) <= max_connect_interval
        });
        before - self.records.len()
    }

    /// Forgets everything about `ip`, used when its blacklist entry expires.
    pub fn forget(&mut self, ip: &IpAddr) {
        self.records.remove(ip);
    }

    /// Returns the record for `ip`, if any.
    pub fn record(&self, ip: &IpAddr) -> Option<&IpRecord> {
        self.records.get(ip)
    }

    /// Number of IPs currently tracked.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when no IP is tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn tracker() -> FailureTracker {
        FailureTracker::new(Duration::from_secs(1), Duration::from_secs(10), 3)
    }

    #[test]
    fn test_first_connection_does_not_open_streak() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_connection(ip(1), now);
        let record = t.record(&ip(1)).unwrap();
        assert!(record.first_failure_at.is_none());
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.last_connect_at, now);
    }

    #[test]
    fn test_second_connection_within_interval_opens_streak() {
        let mut t = tracker();
        let start = Instant::now();
        t.on_connection(ip(1), start);
        let later = start + Duration::from_secs(2);
        t.on_connection(ip(1), later);
        assert_eq!(t.record(&ip(1)).unwrap().first_failure_at, Some(later));

        // a pending streak keeps its original start
        t.on_connection(ip(1), later + Duration::from_millis(500));
        assert_eq!(t.record(&ip(1)).unwrap().first_failure_at, Some(later));
    }

    #[test]
    fn test_idle_sweep_counts_failure() {
        let mut t = tracker();
        let start = Instant::now();
        t.on_connection(ip(1), start);
        t.on_connection(ip(1), start);

        assert_eq!(t.check_for_idlers(start + Duration::from_secs(1)), IdleSweep::default());
        assert_eq!(t.record(&ip(1)).unwrap().consecutive_failures, 0);

        let sweep = t.check_for_idlers(start + Duration::from_secs(2));
        assert_eq!(sweep.failures, 1);
        assert!(sweep.blacklisted.is_empty());
        let record = t.record(&ip(1)).unwrap();
        assert_eq!(record.consecutive_failures, 1);
        assert!(record.first_failure_at.is_none());
    }

    #[test]
    fn test_blacklists_after_allowed_failures() {
        let mut t = tracker();
        let mut now = Instant::now();
        t.on_connection(ip(7), now);
        for round in 1..=3u32 {
            t.on_connection(ip(7), now);
            now += Duration::from_secs(2);
            let sweep = t.check_for_idlers(now);
            assert_eq!(sweep.failures, 1);
            if round < 3 {
                assert!(sweep.blacklisted.is_empty(), "round {round}");
            } else {
                assert_eq!(sweep.blacklisted, vec![ip(7)]);
            }
        }
        assert!(t.record(&ip(7)).is_none());
    }

    #[test]
    fn test_connect_after_blacklisting_is_not_reported_again() {
        let mut t = FailureTracker::new(Duration::from_secs(1), Duration::from_secs(10), 1);
        let start = Instant::now();
        let addr = ip(9);
        t.on_connection(addr, start);
        t.on_connection(addr, start);
        let sweep = t.check_for_idlers(start + Duration::from_secs(2));
        assert_eq!(sweep.blacklisted, vec![addr]);
        assert!(t.record(&addr).is_none());

        // an attempt queued before the blacklist insert lands afterwards
        t.on_connection(addr, start + Duration::from_secs(2));
        let record = t.record(&addr).unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.first_failure_at.is_none());

        let sweep = t.check_for_idlers(start + Duration::from_secs(4));
        assert_eq!(sweep, IdleSweep::default());
    }

    #[test]
    fn test_long_gap_resets_streak() {
        let mut t = tracker();
        let mut now = Instant::now();
        t.on_connection(ip(2), now);
        t.on_connection(ip(2), now);
        now += Duration::from_secs(2);
        t.check_for_idlers(now);
        assert_eq!(t.record(&ip(2)).unwrap().consecutive_failures, 1);

        now += Duration::from_secs(11);
        t.on_connection(ip(2), now);
        let record = t.record(&ip(2)).unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.first_failure_at.is_none());
    }

    #[test]
    fn test_success_clears_state() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_connection(ip(3), now);
        t.on_connection(ip(3), now);
        t.on_success(ip(3));
        assert!(t.record(&ip(3)).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn test_prune_keeps_pending_streaks() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_connection(ip(1), now);
        t.on_connection(ip(2), now);
        t.on_connection(ip(2), now);

        let pruned = t.prune_stale(now + Duration::from_secs(30));
        assert_eq!(pruned, 1);
        assert!(t.record(&ip(1)).is_none());
        assert!(t.record(&ip(2)).is_some());
    }

    #[test]
    fn test_forget() {
        let mut t = tracker();
        t.on_connection(ip(4), Instant::now());
        assert_eq!(t.len(), 1);
        t.forget(&ip(4));
        assert!(t.is_empty());
    }
}

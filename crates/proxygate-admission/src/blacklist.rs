//! Connection-admission blacklist.
//!
//! Tracks IPs that connect but never get a valid request through and rejects
//! them for a while once they fail often enough. Callers only ever touch the
//! read-mostly blacklist set and two bounded queues; the per-IP failure state
//! lives in a single bookkeeping task that owns it outright.

use crate::error::{AdmissionError, Result};
use crate::metrics::AdmissionMetrics;
use crate::tracker::FailureTracker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

/// Blacklist configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    /// When false every connection is admitted and nothing is recorded.
    pub enabled: bool,
    /// How long a connection may stay open without a valid request before it
    /// counts as a failure (default: 30s).
    pub max_idle_time_ms: u64,
    /// Attempts closer together than this belong to the same streak (default: 10s).
    pub max_connect_interval_ms: u64,
    /// Consecutive failures before an IP is blacklisted (default: 10).
    pub allowed_failures: u32,
    /// How long an IP stays blacklisted. In practice up to 1.1x this (default: 6h).
    pub expiration_ms: u64,
    /// Capacity of each bookkeeping queue (default: 10000).
    pub queue_capacity: usize,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_idle_time_ms: 30_000,
            max_connect_interval_ms: 10_000,
            allowed_failures: 10,
            expiration_ms: 6 * 60 * 60 * 1000,
            queue_capacity: 10_000,
        }
    }
}

impl BlacklistConfig {
    /// Checks that every timer period and limit is usable.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(AdmissionError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.max_idle_time_ms == 0 {
            return invalid("max_idle_time_ms must be positive");
        }
        if self.max_connect_interval_ms == 0 {
            return invalid("max_connect_interval_ms must be positive");
        }
        if self.allowed_failures == 0 {
            return invalid("allowed_failures must be positive");
        }
        if self.expiration_ms < 10 {
            return invalid("expiration_ms must be at least 10");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be positive");
        }
        Ok(())
    }

    /// Idle timeout as a duration.
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    /// Reconnect window as a duration.
    pub fn max_connect_interval(&self) -> Duration {
        Duration::from_millis(self.max_connect_interval_ms)
    }

    /// Blacklist expiration as a duration.
    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }
}

type BlacklistSet = Arc<RwLock<HashMap<IpAddr, Instant>>>;

/// Handle to the blacklist. Cheap to clone; all clones share one bookkeeping task.
///
/// The bookkeeping task stops once every handle has been dropped.
#[derive(Clone)]
pub struct Blacklist {
    enabled: bool,
    connections: mpsc::Sender<IpAddr>,
    successes: mpsc::Sender<IpAddr>,
    blacklist: BlacklistSet,
    metrics: Arc<AdmissionMetrics>,
}

impl std::fmt::Debug for Blacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blacklist")
            .field("enabled", &self.enabled)
            .field("blacklisted", &self.blacklisted_count())
            .finish()
    }
}

impl Blacklist {
    /// Validates `config` and spawns the bookkeeping task on the current tokio runtime.
    pub fn start(config: BlacklistConfig) -> Result<Self> {
        Self::start_with_metrics(config, Arc::new(AdmissionMetrics::new()))
    }

    /// Like [`Blacklist::start`] but records into caller-provided counters.
    pub fn start_with_metrics(config: BlacklistConfig, metrics: Arc<AdmissionMetrics>) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| AdmissionError::NoRuntime)?;

        let (connections_tx, connections_rx) = mpsc::channel(config.queue_capacity);
        let (successes_tx, successes_rx) = mpsc::channel(config.queue_capacity);
        let blacklist: BlacklistSet = Arc::new(RwLock::new(HashMap::new()));

        let bookkeeper = Bookkeeper::new(&config, Arc::clone(&blacklist), Arc::clone(&metrics));
        runtime.spawn(bookkeeper.run(connections_rx, successes_rx));

        if !config.enabled {
            warn!("IP blacklisting is disabled, every connection will be admitted");
        }

        Ok(Self {
            enabled: config.enabled,
            connections: connections_tx,
            successes: successes_tx,
            blacklist,
            metrics,
        })
    }

    /// Records a connection attempt from `ip`. Returns false if the IP is blacklisted.
    ///
    /// Never blocks: the attempt is queued for bookkeeping and dropped if the
    /// queue is full.
    pub fn on_connect(&self, ip: IpAddr) -> bool {
        if !self.enabled {
            self.metrics.record_check(false);
            return true;
        }
        if self.is_blacklisted(ip) {
            debug!(client_ip = %ip, "rejecting blacklisted IP");
            self.metrics.record_check(true);
            return false;
        }
        match self.connections.try_send(ip) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.inc_connect_dropped();
                warn!(client_ip = %ip, "unable to record connection, queue full");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.inc_connect_dropped();
                error!(client_ip = %ip, "unable to record connection, bookkeeping stopped");
            }
        }
        self.metrics.record_check(false);
        true
    }

    /// Records a valid request from `ip`, which resets its failure count and
    /// removes it from the blacklist.
    pub fn succeed(&self, ip: IpAddr) {
        match self.successes.try_send(ip) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.inc_success_dropped();
                warn!(client_ip = %ip, "unable to record success, queue full");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.inc_success_dropped();
                error!(client_ip = %ip, "unable to record success, bookkeeping stopped");
            }
        }
    }

    /// Returns true if `ip` is currently in the blacklist set.
    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.blacklist
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&ip)
    }

    /// Number of IPs currently blacklisted.
    pub fn blacklisted_count(&self) -> usize {
        self.blacklist.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Counters shared with the bookkeeping task.
    pub fn metrics(&self) -> &Arc<AdmissionMetrics> {
        &self.metrics
    }
}

struct Bookkeeper {
    tracker: FailureTracker,
    max_idle_time: Duration,
    expiration: Duration,
    blacklist: BlacklistSet,
    metrics: Arc<AdmissionMetrics>,
}

impl Bookkeeper {
    fn new(config: &BlacklistConfig, blacklist: BlacklistSet, metrics: Arc<AdmissionMetrics>) -> Self {
        Self {
            tracker: FailureTracker::new(
                config.max_idle_time(),
                config.max_connect_interval(),
                config.allowed_failures,
            ),
            max_idle_time: config.max_idle_time(),
            expiration: config.expiration(),
            blacklist,
            metrics,
        }
    }

    async fn run(mut self, mut connections: mpsc::Receiver<IpAddr>, mut successes: mpsc::Receiver<IpAddr>) {
        let expiration_period = self.expiration / 10;
        let mut idle_timer = interval_at(Instant::now() + self.max_idle_time, self.max_idle_time);
        let mut expiration_timer = interval_at(Instant::now() + expiration_period, expiration_period);
        idle_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        expiration_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ip = connections.recv() => match ip {
                    Some(ip) => self.tracker.on_connection(ip, Instant::now()),
                    None => break,
                },
                ip = successes.recv() => match ip {
                    Some(ip) => self.on_success(ip),
                    None => break,
                },
                _ = idle_timer.tick() => self.check_for_idlers(),
                _ = expiration_timer.tick() => self.check_expiration(),
            }
        }
        debug!("blacklist bookkeeping stopped");
    }

    fn on_success(&mut self, ip: IpAddr) {
        self.tracker.on_success(ip);
        let removed = self
            .blacklist
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ip);
        if removed.is_some() {
            debug!(client_ip = %ip, "removed from blacklist after success");
        }
    }

    fn check_for_idlers(&mut self) {
        trace!("checking for idlers");
        let now = Instant::now();
        let before = self.tracker.len();
        let sweep = self.tracker.check_for_idlers(now);
        self.metrics.add_idle_failures(sweep.failures as u64);
        let additions = sweep.blacklisted;
        let pruned = self.tracker.prune_stale(now);
        if pruned > 0 {
            trace!(pruned, tracked = before - pruned, "pruned stale connection records");
        }
        if additions.is_empty() {
            return;
        }

        for ip in &additions {
            warn!(client_ip = %ip, "blacklisting");
        }
        self.metrics.add_blacklisted(additions.len() as u64);
        let mut blacklist = self.blacklist.write().unwrap_or_else(PoisonError::into_inner);
        for ip in additions {
            blacklist.insert(ip, now);
        }
    }

    fn check_expiration(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut blacklist = self.blacklist.write().unwrap_or_else(PoisonError::into_inner);
            blacklist.retain(|ip, blacklisted_at| {
                let keep = now.saturating_duration_since(*blacklisted_at) <= self.expiration;
                if !keep {
                    expired.push(*ip);
                }
                keep
            });
        }
        for ip in &expired {
            debug!(client_ip = %ip, "removing from blacklist");
            self.tracker.forget(ip);
        }
        self.metrics.add_expired(expired.len() as u64);
    }
}

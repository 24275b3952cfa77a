//! Byte-rate limiting for throttled connections.
//!
//! A token bucket refilled continuously at the configured rate. Callers ask
//! for an allowance before an I/O call and consume what the call actually
//! moved, so a pending or short read never costs more than it transferred.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Throttle rate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Ceiling in bytes per second, applied to each direction separately.
    pub rate_bytes_per_sec: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            rate_bytes_per_sec: 250 * 1024,
        }
    }
}

impl ThrottleConfig {
    /// Creates a config with the given ceiling.
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self { rate_bytes_per_sec }
    }

    /// Checks the rate ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.rate_bytes_per_sec == 0 {
            return Err(TransportError::InvalidThrottleConfig {
                reason: "rate_bytes_per_sec must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Largest single allowance: a tenth of a second at the configured rate.
    pub fn burst_bytes(&self) -> u64 {
        (self.rate_bytes_per_sec / 10).max(1)
    }
}

// Refill arithmetic tolerates this much rounding before waiting again.
const EPSILON: f64 = 1e-6;

/// Token bucket polled from `AsyncRead`/`AsyncWrite` implementations.
pub(crate) struct RateLimiter {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .field("tokens", &self.tokens)
            .finish()
    }
}

impl RateLimiter {
    /// Creates an empty bucket, so the first throttled call already waits.
    pub(crate) fn new(config: &ThrottleConfig) -> Self {
        Self {
            rate: config.rate_bytes_per_sec.max(1) as f64,
            capacity: config.burst_bytes() as f64,
            tokens: 0.0,
            last_refill: Instant::now(),
            sleep: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed > Duration::ZERO {
            self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Waits until at least `min(want, capacity)` bytes may move, then
    /// returns how many. Nothing is consumed until [`RateLimiter::consume`].
    pub(crate) fn poll_allowance(&mut self, cx: &mut Context<'_>, want: usize) -> Poll<usize> {
        if want == 0 {
            return Poll::Ready(0);
        }
        let target = (want as f64).min(self.capacity);
        loop {
            let now = Instant::now();
            self.refill(now);
            if self.tokens + EPSILON >= target {
                self.sleep = None;
                let available = (self.tokens + EPSILON).floor() as usize;
                return Poll::Ready(available.clamp(1, want));
            }

            let wait = Duration::from_secs_f64((target - self.tokens) / self.rate);
            let deadline = now + wait;
            match self.sleep.as_mut() {
                Some(sleep) => {
                    if sleep.deadline() != deadline {
                        sleep.as_mut().reset(deadline);
                    }
                }
                None => self.sleep = Some(Box::pin(tokio::time::sleep_until(deadline))),
            }

            if let Some(sleep) = self.sleep.as_mut() {
                if sleep.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
            }
        }
    }

    /// Takes `n` bytes out of the bucket.
    pub(crate) fn consume(&mut self, n: usize) {
        self.tokens -= n as f64;
    }
}

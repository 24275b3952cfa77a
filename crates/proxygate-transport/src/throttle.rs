//! Per-connection throttle state machine.
//!
//! A connection starts [`ThrottleState::Off`]. Control messages of kind
//! [`THROTTLE_KIND`] move it between `Off` and `On`, and `"lock"` moves it to
//! `Never`, which is permanent for the life of the connection no matter which
//! signals arrive afterwards.

use crate::metrics::ThrottleMetrics;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

/// Control message kind understood by the throttle.
pub const THROTTLE_KIND: &str = "throttle";

/// Throttle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ThrottleState {
    /// Unthrottled.
    #[default]
    Off = 0,
    /// Throttled at the configured rate.
    On = 1,
    /// Exempt from throttling until the connection closes.
    Never = 2,
}

impl ThrottleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ThrottleState::On,
            2 => ThrottleState::Never,
            _ => ThrottleState::Off,
        }
    }

    /// Returns the state reached by applying `signal` to `self`.
    pub fn transition(self, signal: ThrottleSignal) -> Self {
        match (self, signal) {
            (ThrottleState::Never, _) => ThrottleState::Never,
            (_, ThrottleSignal::Lock) => ThrottleState::Never,
            (_, ThrottleSignal::Enable) => ThrottleState::On,
            (_, ThrottleSignal::Disable) => ThrottleState::Off,
        }
    }
}

/// A recognized throttle payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleSignal {
    /// `"enable"`: start throttling.
    Enable,
    /// `"disable"`: stop throttling.
    Disable,
    /// `"lock"`: never throttle this connection again.
    Lock,
}

impl ThrottleSignal {
    /// Parses a control message payload. Only the strings `"enable"`,
    /// `"disable"` and `"lock"` are recognized.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        match payload.as_str()? {
            "enable" => Some(ThrottleSignal::Enable),
            "disable" => Some(ThrottleSignal::Disable),
            "lock" => Some(ThrottleSignal::Lock),
            _ => None,
        }
    }
}

/// Atomic throttle state shared between a connection and its signal producers.
#[derive(Debug, Default)]
pub struct ThrottleControl {
    state: AtomicU8,
    metrics: Arc<ThrottleMetrics>,
}

impl ThrottleControl {
    /// Creates a control in state `Off` reporting into `metrics`.
    pub fn new(metrics: Arc<ThrottleMetrics>) -> Self {
        Self {
            state: AtomicU8::new(ThrottleState::Off as u8),
            metrics,
        }
    }

    /// Current state.
    pub fn state(&self) -> ThrottleState {
        ThrottleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns true if reads and writes must go through the rate limiter.
    #[inline]
    pub fn is_throttled(&self) -> bool {
        self.state.load(Ordering::Acquire) == ThrottleState::On as u8
    }

    /// Applies `signal` and returns the resulting state.
    pub fn apply(&self, signal: ThrottleSignal) -> ThrottleState {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let current = ThrottleState::from_u8(raw);
                let next = current.transition(signal);
                (next != current).then_some(next as u8)
            });

        match previous {
            Ok(raw) => {
                let from = ThrottleState::from_u8(raw);
                let to = from.transition(signal);
                match to {
                    ThrottleState::On => self.metrics.inc_enables(),
                    ThrottleState::Off => self.metrics.inc_disables(),
                    ThrottleState::Never => self.metrics.inc_locks(),
                }
                trace!(?from, ?to, ?signal, "throttle state changed");
                to
            }
            Err(raw) => ThrottleState::from_u8(raw),
        }
    }

    /// Handles the payload of a [`THROTTLE_KIND`] control message.
    ///
    /// Unrecognized payloads are logged and leave the state unchanged.
    pub fn handle_payload(&self, payload: &Value) -> ThrottleState {
        if self.state() == ThrottleState::Never {
            return ThrottleState::Never;
        }
        match ThrottleSignal::from_payload(payload) {
            Some(signal) => self.apply(signal),
            None => {
                self.metrics.inc_unhandled();
                error!(%payload, "unhandled throttle message");
                self.state()
            }
        }
    }
}

/// Cloneable handle used by other tasks to signal one connection.
#[derive(Debug, Clone)]
pub struct ThrottleHandle {
    control: Arc<ThrottleControl>,
}

impl ThrottleHandle {
    pub(crate) fn new(control: Arc<ThrottleControl>) -> Self {
        Self { control }
    }

    /// Starts throttling unless the connection is locked.
    pub fn enable(&self) -> ThrottleState {
        self.control.apply(ThrottleSignal::Enable)
    }

    /// Stops throttling unless the connection is locked.
    pub fn disable(&self) -> ThrottleState {
        self.control.apply(ThrottleSignal::Disable)
    }

    /// Exempts the connection from throttling for good.
    pub fn lock(&self) -> ThrottleState {
        self.control.apply(ThrottleSignal::Lock)
    }

    /// Applies a raw throttle payload.
    pub fn signal(&self, payload: &Value) -> ThrottleState {
        self.control.handle_payload(payload)
    }

    /// Current state.
    pub fn state(&self) -> ThrottleState {
        self.control.state()
    }
}

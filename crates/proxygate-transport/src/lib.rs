#![warn(missing_docs)]

//! proxygate transport: per-connection throttling and bandwidth estimation.
//!
//! [`ThrottledListener`] wraps accepted streams in [`ThrottledConn`], which
//! caps throughput while its throttle state is `On`. The state is driven out
//! of band through [`ConnControl::control_message`]. [`BandwidthEstimator`]
//! smooths bandwidth samples for whoever decides when to throttle.

pub mod conn;
pub mod error;
pub mod estimator;
pub mod listener;
pub mod metrics;
pub mod ratelimit;
pub mod throttle;

pub use conn::{ConnControl, ConnState, ThrottledConn};
pub use error::{Result, TransportError};
pub use estimator::{BandwidthEstimator, EstimatorConfig};
pub use listener::ThrottledListener;
pub use metrics::{ThrottleMetrics, ThrottleSnapshot};
pub use ratelimit::ThrottleConfig;
pub use throttle::{ThrottleControl, ThrottleHandle, ThrottleSignal, ThrottleState, THROTTLE_KIND};

#![warn(missing_docs)]

//! proxygate admission subsystem: per-IP connection blacklist, privileged token
//! and device registries.

pub mod blacklist;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod tracker;

pub use blacklist::{Blacklist, BlacklistConfig};
pub use error::{AdmissionError, Result};
pub use metrics::{AdmissionMetrics, AdmissionSnapshot};
pub use registry::{DeviceRegistry, TokenRegistry};

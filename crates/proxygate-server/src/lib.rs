#![warn(missing_docs)]

//! proxygate server: composes the admission blacklist and the throttled
//! listener into a TCP relay.

pub mod cli;
pub mod config;
pub mod listener;
pub mod privilege;
pub mod relay;

pub use config::ServerConfig;
pub use listener::AdmissionListener;
pub use privilege::apply_privilege;
pub use relay::Server;

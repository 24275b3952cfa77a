use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid throttle config: {reason}")]
    InvalidThrottleConfig { reason: String },

    #[error("invalid estimator config: {reason}")]
    InvalidEstimatorConfig { reason: String },

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

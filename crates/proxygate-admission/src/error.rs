use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid blacklist config: {reason}")]
    InvalidConfig { reason: String },

    #[error("blacklist bookkeeping requires a tokio runtime")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

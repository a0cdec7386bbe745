//! Error types for the settlement engine

use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Grant, collection or storage error from the core
    #[error(transparent)]
    Core(#[from] atc_core::Error),

    /// Payment rail refused or failed the request
    #[error("Payment rail error: {0}")]
    Rail(String),

    /// Payment rail did not answer in time
    #[error("Payment rail timed out after {0}s")]
    RailTimeout(u64),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Rail(_) | Error::RailTimeout(_) => true,
            Error::Core(e) => e.is_retryable(),
            _ => false,
        }
    }
}

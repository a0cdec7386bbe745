//! Error types for the ATC core

use thiserror::Error;

/// Result type for ATC operations
pub type Result<T> = std::result::Result<T, Error>;

/// ATC errors
///
/// The first block of variants is the caller-facing taxonomy; the rest are
/// infrastructure failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request (recovered at the boundary)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Grantor lacks standing, or an overlapping active grant exists
    #[error("Authority conflict: {0}")]
    AuthorityConflict(String),

    /// Per-transaction or cumulative cap would be exceeded
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// Grant exists but does not permit this collection (status, window, method, scope)
    #[error("Collection not allowed: {0}")]
    CollectionNotAllowed(String),

    /// No active grant matches the collection context
    #[error("No grant found: {0}")]
    NoGrantFound(String),

    /// Tiered commission terms have no tier for the amount
    #[error("No matching commission tier for amount {0}")]
    NoMatchingTier(String),

    /// Payment rail failure
    #[error("Payment rail error: {0}")]
    PaymentRail(String),

    /// Concurrent mutation of the same record
    #[error("Optimistic conflict: {0}")]
    OptimisticConflict(String),

    /// State machine transition not permitted
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Grant not found
    #[error("Grant not found: {0}")]
    GrantNotFound(String),

    /// Collection not found
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// Settlement batch not found
    #[error("Settlement batch not found: {0}")]
    BatchNotFound(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the operation may succeed if simply repeated
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::OptimisticConflict(_) | Error::PaymentRail(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Run `op`, repeating it once if the first attempt hits an optimistic conflict.
pub fn retry_on_conflict<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(Error::OptimisticConflict(msg)) => {
            tracing::debug!(reason = %msg, "Optimistic conflict, retrying once");
            op()
        }
        other => other,
    }
}

//! Error types for the log client

use fpki_core::{FpkiError, LeafKey};
use thiserror::Error;

/// Result type for log client operations
pub type Result<T> = std::result::Result<T, LogClientError>;

/// Errors reported by a `LogBackend` call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The requested leaf or proof does not exist (yet)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend could not be reached or is overloaded
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the request as malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other backend failure
    #[error("Backend internal error: {0}")]
    Internal(String),
}

impl BackendError {
    /// Whether retrying the same call may succeed
    ///
    /// `NotFound` counts as transient: during proof polling it means the leaf
    /// has not been sequenced yet.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::NotFound(_) | BackendError::Unavailable(_))
    }
}

/// Errors that can occur in the log submission engine
#[derive(Error, Debug)]
pub enum LogClientError {
    /// A backend call failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The backend contradicted something it reported earlier
    #[error("Backend inconsistency: {0}")]
    BackendInconsistency(String),

    /// A bounded wait elapsed before completing
    #[error("Timed out {operation} after {completed} of {expected} completed")]
    Timeout {
        operation: &'static str,
        completed: u64,
        expected: u64,
    },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// First hard error of a batch submission
    #[error("Submission failed for leaf {leaf} after {acknowledged} of {total} acknowledged: {source}")]
    Submission {
        leaf: LeafKey,
        acknowledged: usize,
        total: usize,
        #[source]
        source: Box<LogClientError>,
    },

    /// Cryptographic failure (e.g. root signature)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A worker task panicked or was aborted unexpectedly
    #[error("Worker failed: {0}")]
    WorkerFailed(String),
}

impl LogClientError {
    /// Whether the error means the caller gave up rather than the log failing
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LogClientError::Cancelled)
    }

    /// Whether the operation may still have taken effect in the log
    ///
    /// Timed-out and cancelled submissions can be sequenced later; callers
    /// should not treat them as rejected.
    pub fn may_have_landed(&self) -> bool {
        match self {
            LogClientError::Timeout { .. } | LogClientError::Cancelled => true,
            LogClientError::Submission { acknowledged, .. } => *acknowledged > 0,
            LogClientError::Backend(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<FpkiError> for LogClientError {
    fn from(err: FpkiError) -> Self {
        match err {
            FpkiError::SerializationError(msg) => LogClientError::Serialization(msg),
            other => LogClientError::Crypto(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for LogClientError {
    fn from(err: serde_json::Error) -> Self {
        LogClientError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for LogClientError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            LogClientError::Cancelled
        } else {
            LogClientError::WorkerFailed(err.to_string())
        }
    }
}

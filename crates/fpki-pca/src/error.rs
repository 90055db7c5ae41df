//! Issuer error types

use fpki_core::{FpkiError, VerificationError};
use fpki_logclient::LogClientError;
use thiserror::Error;

use crate::storage::StorageError;

/// Result type alias using PcaError
pub type Result<T> = std::result::Result<T, PcaError>;

/// Errors raised by the issuer
#[derive(Error, Debug)]
pub enum PcaError {
    /// The request is not signed by the key it carries
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// No serial number could be reserved
    #[error("Serial number allocation failed: {0}")]
    SerialAllocation(String),

    /// Domain-level lookup found nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// A proof of logging did not verify
    #[error("Verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The log could not be reached or misbehaved
    #[error("Log error: {0}")]
    Log(#[from] LogClientError),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A certificate or name was not in a usable state
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<FpkiError> for PcaError {
    fn from(err: FpkiError) -> Self {
        match err {
            FpkiError::InvalidSignature(msg) => PcaError::InvalidSignature(msg),
            FpkiError::KeyGeneration(msg) => PcaError::KeyGeneration(msg),
            other if other.is_crypto() => PcaError::Crypto(other.to_string()),
            FpkiError::SerializationError(msg) => PcaError::Serialization(msg),
            other => PcaError::InvalidCertificate(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_failures_stay_crypto() {
        let err = PcaError::from(FpkiError::Signing("rsa".into()));
        assert!(matches!(err, PcaError::Crypto(_)));
        let err = PcaError::from(FpkiError::InvalidKey("pem".into()));
        assert!(matches!(err, PcaError::Crypto(_)));
        let err = PcaError::from(FpkiError::KeyGeneration("rng".into()));
        assert!(matches!(err, PcaError::KeyGeneration(_)));
        let err = PcaError::from(FpkiError::InvalidSignature("bad".into()));
        assert!(matches!(err, PcaError::InvalidSignature(_)));
    }

    #[test]
    fn test_state_errors_are_not_crypto() {
        let err = PcaError::from(FpkiError::AlreadyLogged("example.com".into()));
        assert!(matches!(err, PcaError::InvalidCertificate(_)));
        let err = PcaError::from(FpkiError::SerializationError("eof".into()));
        assert!(matches!(err, PcaError::Serialization(_)));
    }
}

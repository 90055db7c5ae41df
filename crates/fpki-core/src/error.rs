//! Error types for F-PKI core objects

use thiserror::Error;

/// Result type alias using FpkiError
pub type Result<T> = std::result::Result<T, FpkiError>;

/// Errors raised while building, signing or verifying policy objects
#[derive(Error, Debug)]
pub enum FpkiError {
    /// RSA key generation failed (entropy or algorithm failure)
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Producing a signature failed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// A signature did not verify against the expected key
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// A public key could not be decoded
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Domain name failed validation
    #[error("Invalid domain name '{0}': {1}")]
    InvalidDomain(String, String),

    /// A certificate already carries a proof of logging
    #[error("Certificate for '{0}' already has a proof of logging attached")]
    AlreadyLogged(String),
}

impl FpkiError {
    /// Whether this error came out of a cryptographic primitive
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            FpkiError::KeyGeneration(_)
                | FpkiError::Signing(_)
                | FpkiError::InvalidSignature(_)
                | FpkiError::InvalidKey(_)
        )
    }
}

impl From<serde_json::Error> for FpkiError {
    fn from(err: serde_json::Error) -> Self {
        FpkiError::SerializationError(err.to_string())
    }
}

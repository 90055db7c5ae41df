//! Issuance requests (RCSR) and the domain owner that builds them
//!
//! A request is signed twice when the owner has rotated keys before:
//!
//! 1. `prior_key_signature` with the *previous* key, over the request with
//!    both signature fields empty
//! 2. `signature` with the *current* key, over the request with only
//!    `signature` empty (so it covers the prior-key signature too)
//!
//! The PCA checks (2) against the embedded public key and (1) against the
//! public key of the domain's currently valid certificate.

use crate::crypto::{serde_bytes_base64, PublicKey, PublicKeyAlgorithm, SignatureAlgorithm};
use crate::error::{FpkiError, Result};
use crate::keyring::KeyRing;
use crate::types::DomainName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Root certificate signing request sent by a domain owner to a PCA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRequest {
    /// Domain the certificate is requested for
    pub subject: DomainName,

    pub version: u32,

    /// When the owner built the request
    pub timestamp: DateTime<Utc>,

    pub public_key_algorithm: PublicKeyAlgorithm,

    /// PEM-encoded public key the certificate will bind to `subject`
    #[serde(with = "serde_bytes_base64")]
    pub public_key: Vec<u8>,

    pub signature_algorithm: SignatureAlgorithm,

    /// Signature by the previous key; absent on an owner's first request
    #[serde(default, with = "serde_bytes_base64::option")]
    pub prior_key_signature: Option<Vec<u8>>,

    /// Self-signature by the key in `public_key`
    #[serde(with = "serde_bytes_base64")]
    pub signature: Vec<u8>,
}

impl IssuanceRequest {
    /// Bytes covered by `signature`: every field, `signature` emptied
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        serde_json::to_vec(&unsigned).map_err(FpkiError::from)
    }

    /// Bytes covered by `prior_key_signature`: both signature fields emptied
    pub fn prior_key_payload(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        unsigned.prior_key_signature = None;
        serde_json::to_vec(&unsigned).map_err(FpkiError::from)
    }

    /// Decode the embedded public key
    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_pem(&self.public_key)
    }

    /// Verify the self-signature against the embedded public key
    pub fn verify_signature(&self) -> Result<()> {
        let key = self.public_key()?;
        key.verify(&self.signing_payload()?, &self.signature)
    }

    /// Verify the prior-key signature against a previously certified key
    pub fn verify_prior_key_signature(&self, prior_key: &PublicKey) -> Result<()> {
        let signature = self.prior_key_signature.as_deref().ok_or_else(|| {
            FpkiError::InvalidSignature("request carries no prior key signature".into())
        })?;
        prior_key.verify(&self.prior_key_payload()?, signature)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(FpkiError::from)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(FpkiError::from)
    }
}

/// Domain owner: holds a key ring and builds signed issuance requests
#[derive(Debug, Default)]
pub struct DomainOwner {
    keyring: KeyRing,
}

impl DomainOwner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keyring(keyring: KeyRing) -> Self {
        Self { keyring }
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    /// Rotate keys and build a signed request for `subject`
    ///
    /// Rotation happens unconditionally and first: even if signing or a later
    /// submission fails, the ring has moved on and the old current key is now
    /// `previous`.
    pub fn build_request(&mut self, subject: &DomainName, version: u32) -> Result<IssuanceRequest> {
        self.keyring.rotate()?;

        let current = match self.keyring.current() {
            Some(current) => current,
            None => return Err(FpkiError::KeyGeneration("key ring has no current key".into())),
        };

        let mut request = IssuanceRequest {
            subject: subject.clone(),
            version,
            timestamp: Utc::now(),
            public_key_algorithm: PublicKeyAlgorithm::Rsa,
            public_key: current.public_key_pem().to_vec(),
            signature_algorithm: SignatureAlgorithm::RsaSha256,
            prior_key_signature: None,
            signature: Vec::new(),
        };

        if let Some(previous) = self.keyring.previous() {
            let payload = request.prior_key_payload()?;
            request.prior_key_signature = Some(previous.sign(&payload)?);
        }

        let payload = request.signing_payload()?;
        request.signature = current.sign(&payload)?;

        info!(
            subject = %subject,
            version = version,
            key = %current.public_key().fingerprint(),
            chained = request.prior_key_signature.is_some(),
            "Built issuance request"
        );

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> DomainName {
        DomainName::parse(name).unwrap()
    }

    #[test]
    fn test_first_request_has_no_prior_signature() {
        let mut owner = DomainOwner::new();
        let req = owner.build_request(&domain("example.com"), 1).unwrap();

        assert!(req.prior_key_signature.is_none());
        assert!(req.verify_signature().is_ok());
    }

    #[test]
    fn test_second_request_chains_to_first_key() {
        let mut owner = DomainOwner::new();
        let first = owner.build_request(&domain("example.com"), 1).unwrap();
        let second = owner.build_request(&domain("example.com"), 2).unwrap();

        assert!(second.prior_key_signature.is_some());
        assert!(second.verify_signature().is_ok());

        let first_key = first.public_key().unwrap();
        assert!(second.verify_prior_key_signature(&first_key).is_ok());
    }

    #[test]
    fn test_prior_signature_fails_against_unrelated_key() {
        let mut owner = DomainOwner::new();
        owner.build_request(&domain("example.com"), 1).unwrap();
        let second = owner.build_request(&domain("example.com"), 2).unwrap();

        let mut stranger = DomainOwner::new();
        let other = stranger.build_request(&domain("example.com"), 1).unwrap();

        let result = second.verify_prior_key_signature(&other.public_key().unwrap());
        assert!(matches!(result, Err(FpkiError::InvalidSignature(_))));
    }

    #[test]
    fn test_tampered_request_fails_self_verification() {
        let mut owner = DomainOwner::new();
        let mut req = owner.build_request(&domain("example.com"), 1).unwrap();
        req.subject = domain("attacker.com");

        assert!(matches!(req.verify_signature(), Err(FpkiError::InvalidSignature(_))));
    }

    #[test]
    fn test_signature_covers_prior_key_signature() {
        let mut owner = DomainOwner::new();
        owner.build_request(&domain("example.com"), 1).unwrap();
        let mut req = owner.build_request(&domain("example.com"), 2).unwrap();
        req.prior_key_signature = None;

        assert!(req.verify_signature().is_err());
    }

    #[test]
    fn test_serialization_roundtrip_keeps_signature_valid() {
        let mut owner = DomainOwner::new();
        owner.build_request(&domain("example.com"), 1).unwrap();
        let req = owner.build_request(&domain("example.com"), 2).unwrap();

        let restored = IssuanceRequest::from_bytes(&req.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, req);
        assert!(restored.verify_signature().is_ok());
    }
}

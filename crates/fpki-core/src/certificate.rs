//! Policy certificates (RPC) and signed proofs of logging (SPT)
//!
//! A `Certificate` starts life as a pre-certificate: issuer-signed but with no
//! proof of logging. Attaching the first `Spt` makes it valid, and it is
//! never mutated again. The issuer signature excludes
//! `proofs_of_logging`, so attaching a proof leaves it intact.

use crate::crypto::{
    serde_bytes_base64, KeyPair, PublicKey, PublicKeyAlgorithm, SignatureAlgorithm,
};
use crate::error::{FpkiError, Result};
use crate::merkle::{InclusionProof, LeafKey, LogHasher, LogRoot, Rfc6962Hasher, SignedLogRoot};
use crate::request::IssuanceRequest;
use crate::types::DomainName;
use crate::verifier::{ProofVerifier, VerificationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of object a proof of logging was issued for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertType {
    #[default]
    PolicyCertificate,
}

/// Root policy certificate issued by a PCA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub subject: DomainName,
    pub version: u32,
    pub public_key_algorithm: PublicKeyAlgorithm,

    /// PEM public key copied from the request
    #[serde(with = "serde_bytes_base64")]
    pub public_key: Vec<u8>,

    /// Name of the issuing PCA
    pub ca_name: String,

    pub signature_algorithm: SignatureAlgorithm,

    /// Issuance time
    pub timestamp: DateTime<Utc>,

    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,

    /// Unique per issuer
    pub serial_number: u64,

    /// Copied from the request
    #[serde(default, with = "serde_bytes_base64::option")]
    pub prior_key_signature: Option<Vec<u8>>,

    #[serde(with = "serde_bytes_base64")]
    pub issuer_signature: Vec<u8>,

    #[serde(default)]
    pub proofs_of_logging: Vec<Spt>,
}

/// Unsigned certificate fields taken from the issuer's decisions
#[derive(Debug, Clone)]
pub struct IssuanceTerms {
    pub ca_name: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial_number: u64,
}

impl Certificate {
    /// Build and sign a pre-certificate for an already verified request
    pub fn presign(
        request: &IssuanceRequest,
        terms: IssuanceTerms,
        issuer_key: &KeyPair,
    ) -> Result<Self> {
        let mut cert = Self {
            subject: request.subject.clone(),
            version: request.version,
            public_key_algorithm: request.public_key_algorithm,
            public_key: request.public_key.clone(),
            ca_name: terms.ca_name,
            signature_algorithm: request.signature_algorithm,
            timestamp: Utc::now(),
            not_before: terms.not_before,
            not_after: terms.not_after,
            serial_number: terms.serial_number,
            prior_key_signature: request.prior_key_signature.clone(),
            issuer_signature: Vec::new(),
            proofs_of_logging: Vec::new(),
        };
        cert.issuer_signature = issuer_key.sign(&cert.issuer_signing_payload()?)?;
        Ok(cert)
    }

    /// Bytes covered by `issuer_signature`
    pub fn issuer_signing_payload(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.issuer_signature = Vec::new();
        unsigned.proofs_of_logging = Vec::new();
        serde_json::to_vec(&unsigned).map_err(FpkiError::from)
    }

    pub fn verify_issuer_signature(&self, issuer_key: &PublicKey) -> Result<()> {
        issuer_key.verify(&self.issuer_signing_payload()?, &self.issuer_signature)
    }

    /// Subject public key
    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_pem(&self.public_key)
    }

    /// Leaf submitted to the log: the pre-certificate without proofs
    pub fn leaf_bytes(&self) -> Result<Vec<u8>> {
        let mut pre = self.clone();
        pre.proofs_of_logging = Vec::new();
        serde_json::to_vec(&pre).map_err(FpkiError::from)
    }

    pub fn leaf_hash(&self) -> Result<Vec<u8>> {
        Ok(Rfc6962Hasher.hash_leaf(&self.leaf_bytes()?))
    }

    pub fn leaf_key(&self) -> Result<LeafKey> {
        Ok(LeafKey::from_leaf_hash(&self.leaf_hash()?))
    }

    /// Whether a proof of logging has been attached
    pub fn is_valid(&self) -> bool {
        !self.proofs_of_logging.is_empty()
    }

    /// Attach the first proof of logging, making the certificate valid
    pub fn attach_proof(&mut self, spt: Spt) -> Result<()> {
        if self.is_valid() {
            return Err(FpkiError::AlreadyLogged(self.subject.to_string()));
        }
        self.proofs_of_logging.push(spt);
        Ok(())
    }

    /// Check that every attached proof includes this certificate's leaf
    pub fn verify_proofs<H: LogHasher>(
        &self,
        verifier: &ProofVerifier<H>,
    ) -> std::result::Result<(), VerificationError> {
        if self.proofs_of_logging.is_empty() {
            return Err(VerificationError::InclusionMismatch(format!(
                "certificate for '{}' carries no proof of logging",
                self.subject
            )));
        }

        let leaf = self
            .leaf_bytes()
            .map_err(|e| VerificationError::MalformedProof(e.to_string()))?;
        let leaf_hash = verifier.hasher().hash_leaf(&leaf);

        for spt in &self.proofs_of_logging {
            let root = spt
                .log_root()
                .map_err(|e| VerificationError::MalformedProof(e.to_string()))?;
            let proofs = spt
                .inclusion_proofs()
                .map_err(|e| VerificationError::MalformedProof(e.to_string()))?;
            verifier.verify_inclusion(&root, &leaf_hash, &proofs)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(FpkiError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(FpkiError::from)
    }
}

/// Signed proof of logging, as returned by the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spt {
    pub version: u32,
    pub subject: DomainName,
    pub ca_name: String,
    pub log_id: String,
    pub cert_type: CertType,
    pub added_timestamp: DateTime<Utc>,

    /// Encoded `SignedLogRoot` the inclusion proofs are anchored to
    #[serde(with = "serde_bytes_base64")]
    pub signed_tree_head: Vec<u8>,

    /// Encoded list of `InclusionProof`
    #[serde(with = "serde_bytes_base64")]
    pub proof_of_inclusion: Vec<u8>,

    /// Size of the tree the proof was generated at
    pub tree_head_serial_number: u64,

    /// Log signature over the tree head
    #[serde(with = "serde_bytes_base64")]
    pub signature: Vec<u8>,
}

impl Spt {
    /// Pack inclusion proofs and the signed root they were fetched at
    pub fn from_inclusion(
        subject: DomainName,
        ca_name: impl Into<String>,
        log_id: impl Into<String>,
        signed_root: &SignedLogRoot,
        proofs: &[InclusionProof],
    ) -> Result<Self> {
        let root = LogRoot::from_signed(signed_root)?;
        Ok(Self {
            version: 1,
            subject,
            ca_name: ca_name.into(),
            log_id: log_id.into(),
            cert_type: CertType::PolicyCertificate,
            added_timestamp: root.timestamp,
            signed_tree_head: signed_root.to_bytes()?,
            proof_of_inclusion: serde_json::to_vec(proofs)?,
            tree_head_serial_number: root.tree_size,
            signature: signed_root.signature.clone(),
        })
    }

    pub fn signed_log_root(&self) -> Result<SignedLogRoot> {
        SignedLogRoot::from_bytes(&self.signed_tree_head)
    }

    /// Decode the tree head the proofs are anchored to
    pub fn log_root(&self) -> Result<LogRoot> {
        LogRoot::from_signed(&self.signed_log_root()?)
    }

    pub fn inclusion_proofs(&self) -> Result<Vec<InclusionProof>> {
        serde_json::from_slice(&self.proof_of_inclusion).map_err(FpkiError::from)
    }

    /// Verify the log's signature over the embedded tree head
    pub fn verify_log_signature(&self, log_key: &PublicKey) -> Result<()> {
        self.signed_log_root()?.verify(log_key)
    }
}

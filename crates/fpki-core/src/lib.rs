//! # F-PKI Core
//!
//! Policy objects and cryptographic primitives shared by domain owners, the
//! policy certificate authority (PCA) and log clients.
//!
//! ## Key Concepts
//!
//! - **KeyRing**: current signing key plus the one it replaced
//! - **IssuanceRequest (RCSR)**: self-signed request, optionally chained to the previous key
//! - **Certificate (RPC)**: issuer-signed policy certificate, valid once a proof of logging is attached
//! - **SPT**: signed proof that a pre-certificate was included in the transparency log
//! - **ProofVerifier**: RFC 6962 inclusion and consistency checks
//!
//! ## Issuance Flow
//!
//! 1. A `DomainOwner` rotates its key ring and builds a signed request
//! 2. The PCA verifies it and pre-signs a `Certificate`
//! 3. The pre-certificate is logged; the returned `Spt` is attached

pub mod certificate;
pub mod crypto;
pub mod error;
pub mod keyring;
pub mod merkle;
pub mod request;
pub mod types;
pub mod verifier;

pub use certificate::{CertType, Certificate, IssuanceTerms, Spt};
pub use crypto::{KeyPair, PublicKey, PublicKeyAlgorithm, SignatureAlgorithm};
pub use error::{FpkiError, Result};
pub use keyring::KeyRing;
pub use merkle::{
    ConsistencyProof, InclusionProof, LeafKey, LogHasher, LogRoot, MerkleTree, Rfc6962Hasher,
    SignedLogRoot,
};
pub use request::{DomainOwner, IssuanceRequest};
pub use types::DomainName;
pub use verifier::{ProofVerifier, VerificationError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Storage abstraction for issuer state
//!
//! The issuer keeps its working state in memory and writes every change
//! through to an `IssuerStore` before applying it, so a restarted issuer can
//! be rebuilt from the store alone. The store only needs atomic get/set per
//! key and an atomic serial counter; encoding is up to the implementation.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use fpki_core::{Certificate, DomainName, LogRoot, Spt};
use std::fmt::Debug;

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backing store failed to read or write
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The serial counter cannot advance any further
    #[error("Serial numbers exhausted")]
    SerialExhausted,
}

/// Persistent state behind an `Issuer`
///
/// Implementations must be thread-safe. Each method is atomic on its own;
/// the issuer serializes calls that must be applied together.
#[async_trait]
pub trait IssuerStore: Send + Sync + Debug {
    // =========================================================================
    // Serial Numbers
    // =========================================================================

    /// Reserve the next serial number
    ///
    /// Serials are never handed out twice over the lifetime of the store,
    /// including across restarts of the issuer using it.
    async fn next_serial(&self) -> Result<u64, StorageError>;

    // =========================================================================
    // Certificates
    // =========================================================================

    /// Store the pending pre-certificate for its subject, replacing any other
    async fn put_presigned(&self, cert: &Certificate) -> Result<(), StorageError>;

    async fn remove_presigned(&self, subject: &DomainName) -> Result<(), StorageError>;

    async fn list_presigned(&self) -> Result<Vec<Certificate>, StorageError>;

    /// Store the valid certificate for its subject, replacing any other
    async fn put_valid(&self, cert: &Certificate) -> Result<(), StorageError>;

    async fn list_valid(&self) -> Result<Vec<Certificate>, StorageError>;

    async fn put_recently_validated(&self, cert: &Certificate) -> Result<(), StorageError>;

    async fn remove_recently_validated(&self, subject: &DomainName) -> Result<(), StorageError>;

    async fn list_recently_validated(&self) -> Result<Vec<Certificate>, StorageError>;

    // =========================================================================
    // Proofs And Roots
    // =========================================================================

    /// Append a proof that matched no pending certificate
    async fn push_quarantined(&self, spt: &Spt) -> Result<(), StorageError>;

    async fn list_quarantined(&self) -> Result<Vec<Spt>, StorageError>;

    /// Record the newest log root the issuer has verified
    async fn put_trusted_root(&self, root: &LogRoot) -> Result<(), StorageError>;

    async fn get_trusted_root(&self) -> Result<Option<LogRoot>, StorageError>;

    /// Get a description of this store (for logging)
    fn description(&self) -> &str {
        "unknown"
    }
}

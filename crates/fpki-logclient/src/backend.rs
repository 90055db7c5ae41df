//! Transparency log backend boundary
//!
//! The log itself (tree storage, sequencing, root signing) is an external
//! service. `LogBackend` is the RPC surface the engine consumes; an
//! implementation wraps a transport to a named endpoint.

use async_trait::async_trait;
use fpki_core::{ConsistencyProof, InclusionProof, SignedLogRoot};
use std::fmt::Debug;

use crate::error::BackendError;

/// Identifier of a log instance on the backend
pub type TreeId = i64;

/// Result of an append call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The leaf was already queued or present; nothing new was added
    pub already_exists: bool,
}

/// RPC surface of an append-only log
///
/// Implementations must be safe to call from many workers at once. Every
/// call is a suspension point; the engine bounds and cancels them.
#[async_trait]
pub trait LogBackend: Send + Sync + Debug {
    /// Queue a leaf for inclusion
    ///
    /// # Arguments
    /// * `tree_id` - The log instance
    /// * `leaf` - Opaque leaf bytes
    ///
    /// # Returns
    /// * `Ok(AppendOutcome)` - Acknowledged; not necessarily sequenced yet
    /// * `Err(BackendError)` - The append was not acknowledged
    async fn append(&self, tree_id: TreeId, leaf: &[u8]) -> Result<AppendOutcome, BackendError>;

    /// Inclusion proofs for a leaf hash at a given tree size
    ///
    /// Returns `BackendError::NotFound` while the leaf has not been
    /// sequenced into a tree of that size.
    async fn get_inclusion_proof_by_hash(
        &self,
        tree_id: TreeId,
        leaf_hash: &[u8],
        tree_size: u64,
    ) -> Result<Vec<InclusionProof>, BackendError>;

    /// Latest signed tree head
    async fn get_latest_root(&self, tree_id: TreeId) -> Result<SignedLogRoot, BackendError>;

    /// Consistency proof between two tree sizes
    async fn get_consistency_proof(
        &self,
        tree_id: TreeId,
        from_size: u64,
        to_size: u64,
    ) -> Result<ConsistencyProof, BackendError>;

    /// Get a description of this backend (for logging)
    fn description(&self) -> &str {
        "log backend"
    }
}

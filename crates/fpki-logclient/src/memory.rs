//! In-memory log backend
//!
//! Single-process stand-in for the external log service, for development
//! and tests. Appended leaves are queued and only enter the tree when
//! sequenced, so callers see the same acknowledge-then-sequence gap as
//! against a real log. Data is lost on restart.

use async_trait::async_trait;
use chrono::Utc;
use fpki_core::{
    ConsistencyProof, InclusionProof, KeyPair, LogHasher, MerkleTree, PublicKey, Rfc6962Hasher,
    SignedLogRoot,
};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::backend::{AppendOutcome, LogBackend, TreeId};
use crate::error::BackendError;

/// When queued leaves are merged into the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sequencing {
    /// Every `get_latest_root` call first sequences all queued leaves
    #[default]
    OnRootFetch,
    /// Only explicit `sequence` calls grow the tree
    Manual,
}

#[derive(Debug, Default)]
struct LogState {
    tree: MerkleTree,
    queued: Vec<Vec<u8>>,
    /// Leaf hashes that are queued or sequenced
    seen: HashSet<Vec<u8>>,
}

/// In-memory append-only log
#[derive(Debug)]
pub struct MemoryLogBackend {
    tree_id: TreeId,
    signing_key: KeyPair,
    sequencing: Sequencing,
    state: Mutex<LogState>,
}

impl MemoryLogBackend {
    /// Create a log for `tree_id`, signing roots with `signing_key`
    pub fn new(tree_id: TreeId, signing_key: KeyPair) -> Self {
        Self {
            tree_id,
            signing_key,
            sequencing: Sequencing::default(),
            state: Mutex::new(LogState::default()),
        }
    }

    /// Set the sequencing mode (builder pattern)
    pub fn with_sequencing(mut self, sequencing: Sequencing) -> Self {
        self.sequencing = sequencing;
        self
    }

    /// Key that verifies this log's roots
    pub fn public_key(&self) -> PublicKey {
        self.signing_key.public_key()
    }

    /// Merge every queued leaf into the tree, returning how many were added
    pub fn sequence(&self) -> u64 {
        let mut state = self.lock();
        Self::sequence_locked(&mut state)
    }

    pub fn tree_size(&self) -> u64 {
        self.lock().tree.len()
    }

    pub fn queued(&self) -> usize {
        self.lock().queued.len()
    }

    fn sequence_locked(state: &mut LogState) -> u64 {
        let queued = std::mem::take(&mut state.queued);
        for leaf in &queued {
            state.tree.push(leaf);
        }
        if !queued.is_empty() {
            debug!(added = queued.len(), tree_size = state.tree.len(), "Sequenced leaves");
        }
        queued.len() as u64
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_tree(&self, tree_id: TreeId) -> Result<(), BackendError> {
        if tree_id == self.tree_id {
            Ok(())
        } else {
            Err(BackendError::NotFound(format!("tree {} does not exist", tree_id)))
        }
    }
}

#[async_trait]
impl LogBackend for MemoryLogBackend {
    async fn append(&self, tree_id: TreeId, leaf: &[u8]) -> Result<AppendOutcome, BackendError> {
        self.check_tree(tree_id)?;
        let leaf_hash = Rfc6962Hasher.hash_leaf(leaf);
        let mut state = self.lock();

        if !state.seen.insert(leaf_hash) {
            return Ok(AppendOutcome {
                already_exists: true,
            });
        }
        state.queued.push(leaf.to_vec());
        Ok(AppendOutcome {
            already_exists: false,
        })
    }

    async fn get_inclusion_proof_by_hash(
        &self,
        tree_id: TreeId,
        leaf_hash: &[u8],
        tree_size: u64,
    ) -> Result<Vec<InclusionProof>, BackendError> {
        self.check_tree(tree_id)?;
        let state = self.lock();

        if tree_size > state.tree.len() {
            return Err(BackendError::InvalidArgument(format!(
                "tree size {} exceeds current size {}",
                tree_size,
                state.tree.len()
            )));
        }

        let proofs: Vec<InclusionProof> = state
            .tree
            .find(leaf_hash)
            .into_iter()
            .filter_map(|index| state.tree.inclusion_proof(index, tree_size))
            .collect();

        if proofs.is_empty() {
            return Err(BackendError::NotFound(format!(
                "leaf not in tree of size {}",
                tree_size
            )));
        }
        Ok(proofs)
    }

    async fn get_latest_root(&self, tree_id: TreeId) -> Result<SignedLogRoot, BackendError> {
        self.check_tree(tree_id)?;
        let mut state = self.lock();

        if self.sequencing == Sequencing::OnRootFetch {
            Self::sequence_locked(&mut state);
        }

        SignedLogRoot::sign(state.tree.len(), state.tree.root(), Utc::now(), &self.signing_key)
            .map_err(|e| BackendError::Internal(e.to_string()))
    }

    async fn get_consistency_proof(
        &self,
        tree_id: TreeId,
        from_size: u64,
        to_size: u64,
    ) -> Result<ConsistencyProof, BackendError> {
        self.check_tree(tree_id)?;
        self.lock()
            .tree
            .consistency_proof(from_size, to_size)
            .ok_or_else(|| {
                BackendError::InvalidArgument(format!(
                    "no consistency proof from {} to {}",
                    from_size, to_size
                ))
            })
    }

    fn description(&self) -> &str {
        "in-memory log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fpki_core::LogRoot;

    fn backend() -> MemoryLogBackend {
        MemoryLogBackend::new(1, KeyPair::generate().unwrap())
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let log = backend();
        assert!(!log.append(1, b"leaf").await.unwrap().already_exists);
        assert!(log.append(1, b"leaf").await.unwrap().already_exists);
        assert_eq!(log.queued(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tree() {
        let log = backend();
        let result = log.append(2, b"leaf").await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_leaf_not_found_until_sequenced() {
        let log = backend().with_sequencing(Sequencing::Manual);
        log.append(1, b"leaf").await.unwrap();
        let leaf_hash = Rfc6962Hasher.hash_leaf(b"leaf");

        let result = log.get_inclusion_proof_by_hash(1, &leaf_hash, 0).await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));

        assert_eq!(log.sequence(), 1);
        let proofs = log.get_inclusion_proof_by_hash(1, &leaf_hash, 1).await.unwrap();
        assert_eq!(proofs.len(), 1);
        assert_eq!(proofs[0].leaf_index, 0);
    }

    #[tokio::test]
    async fn test_root_fetch_sequences_and_signs() {
        let log = backend();
        log.append(1, b"a").await.unwrap();
        log.append(1, b"b").await.unwrap();

        let signed = log.get_latest_root(1).await.unwrap();
        signed.verify(&log.public_key()).unwrap();
        let root = LogRoot::from_signed(&signed).unwrap();
        assert_eq!(root.tree_size, 2);
        assert_eq!(log.queued(), 0);
    }

    #[tokio::test]
    async fn test_manual_sequencing_holds_root() {
        let log = backend().with_sequencing(Sequencing::Manual);
        log.append(1, b"a").await.unwrap();

        let root = LogRoot::from_signed(&log.get_latest_root(1).await.unwrap()).unwrap();
        assert_eq!(root.tree_size, 0);
    }
}

//! Inclusion and consistency proof verification
//!
//! `ProofVerifier` is stateless apart from its hash function. Callers hold
//! the trusted root themselves and replace it with whatever
//! `verify_root_progression` returns.
//!
//! The path walks follow RFC 9162 §2.1.3.2 (inclusion) and §2.1.4.2
//! (consistency).

use crate::merkle::{ConsistencyProof, InclusionProof, LogHasher, LogRoot, Rfc6962Hasher};
use thiserror::Error;
use tracing::warn;

/// Proof verification failures; always fatal to the certificate's validity
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// No candidate proof places the leaf under the trusted root
    #[error("Inclusion mismatch: {0}")]
    InclusionMismatch(String),

    /// The new root is not an append-only extension of the trusted root
    #[error("Consistency mismatch: {0}")]
    ConsistencyMismatch(String),

    /// A proof could not be decoded
    #[error("Malformed proof: {0}")]
    MalformedProof(String),
}

/// Verifies Merkle proofs with a fixed hash function
#[derive(Debug, Clone, Default)]
pub struct ProofVerifier<H: LogHasher = Rfc6962Hasher> {
    hasher: H,
}

impl ProofVerifier<Rfc6962Hasher> {
    pub fn new() -> Self {
        Self::with_hasher(Rfc6962Hasher)
    }
}

impl<H: LogHasher> ProofVerifier<H> {
    pub fn with_hasher(hasher: H) -> Self {
        Self { hasher }
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    /// Succeeds if any of `candidates` proves `leaf_hash` under `trusted_root`
    pub fn verify_inclusion(
        &self,
        trusted_root: &LogRoot,
        leaf_hash: &[u8],
        candidates: &[InclusionProof],
    ) -> Result<(), VerificationError> {
        let mut last_reason = String::from("no inclusion proof supplied");

        for proof in candidates {
            match self.root_from_inclusion_proof(
                proof.leaf_index,
                trusted_root.tree_size,
                leaf_hash,
                &proof.hashes,
            ) {
                Ok(root) if root == trusted_root.root_hash => return Ok(()),
                Ok(_) => {
                    last_reason = format!(
                        "proof for index {} yields a different root at size {}",
                        proof.leaf_index, trusted_root.tree_size
                    );
                }
                Err(reason) => last_reason = reason,
            }
        }

        warn!(
            tree_size = trusted_root.tree_size,
            candidates = candidates.len(),
            reason = %last_reason,
            "SECURITY: Inclusion proof rejected"
        );
        Err(VerificationError::InclusionMismatch(last_reason))
    }

    /// Check that `new_root` extends `trusted_root` and return the root to
    /// trust from now on
    ///
    /// A trusted root of size zero accepts any new root: the first root ever
    /// observed is trusted on first use.
    pub fn verify_root_progression(
        &self,
        trusted_root: &LogRoot,
        new_root: &LogRoot,
        proof: &ConsistencyProof,
    ) -> Result<LogRoot, VerificationError> {
        if trusted_root.tree_size == 0 {
            return Ok(new_root.clone());
        }

        let result = self.verify_consistency(
            trusted_root.tree_size,
            new_root.tree_size,
            &trusted_root.root_hash,
            &new_root.root_hash,
            &proof.hashes,
        );

        match result {
            Ok(()) => Ok(new_root.clone()),
            Err(reason) => {
                warn!(
                    from_size = trusted_root.tree_size,
                    to_size = new_root.tree_size,
                    reason = %reason,
                    "SECURITY: Log root is not an extension of the trusted root"
                );
                Err(VerificationError::ConsistencyMismatch(reason))
            }
        }
    }

    /// Verify a leaf proven at `trusted_root`, then carry that trust forward
    /// to `new_root`
    pub fn verify_inclusion_across_growth(
        &self,
        trusted_root: &LogRoot,
        new_root: &LogRoot,
        consistency: &ConsistencyProof,
        leaf_hash: &[u8],
        proofs: &[InclusionProof],
    ) -> Result<LogRoot, VerificationError> {
        self.verify_inclusion(trusted_root, leaf_hash, proofs)?;
        self.verify_root_progression(trusted_root, new_root, consistency)
    }

    fn root_from_inclusion_proof(
        &self,
        index: u64,
        size: u64,
        leaf_hash: &[u8],
        path: &[Vec<u8>],
    ) -> Result<Vec<u8>, String> {
        if index >= size {
            return Err(format!("leaf index {} outside tree of size {}", index, size));
        }

        let (mut fn_, mut sn) = (index, size - 1);
        let mut r = leaf_hash.to_vec();

        for p in path {
            if sn == 0 {
                return Err("inclusion path longer than the tree is deep".into());
            }
            if fn_ & 1 == 1 || fn_ == sn {
                r = self.hasher.hash_children(p, &r);
                if fn_ & 1 == 0 {
                    while fn_ & 1 == 0 && fn_ != 0 {
                        fn_ >>= 1;
                        sn >>= 1;
                    }
                }
            } else {
                r = self.hasher.hash_children(&r, p);
            }
            fn_ >>= 1;
            sn >>= 1;
        }

        if sn != 0 {
            return Err("inclusion path shorter than the tree is deep".into());
        }
        Ok(r)
    }

    fn verify_consistency(
        &self,
        first: u64,
        second: u64,
        first_hash: &[u8],
        second_hash: &[u8],
        path: &[Vec<u8>],
    ) -> Result<(), String> {
        if first > second {
            return Err(format!("tree shrank from {} to {}", first, second));
        }
        if first == second {
            if !path.is_empty() {
                return Err("non-empty proof between equal tree sizes".into());
            }
            if first_hash != second_hash {
                return Err(format!("two different roots at tree size {}", first));
            }
            return Ok(());
        }
        if path.is_empty() {
            return Err("empty consistency proof".into());
        }

        // A power-of-two first tree is a complete subtree; its root starts the walk.
        let mut nodes: Vec<&[u8]> = Vec::with_capacity(path.len() + 1);
        if first.is_power_of_two() {
            nodes.push(first_hash);
        }
        nodes.extend(path.iter().map(Vec::as_slice));

        let (mut fn_, mut sn) = (first - 1, second - 1);
        while fn_ & 1 == 1 {
            fn_ >>= 1;
            sn >>= 1;
        }

        let mut fr = nodes[0].to_vec();
        let mut sr = nodes[0].to_vec();

        for c in &nodes[1..] {
            if sn == 0 {
                return Err("consistency path too long".into());
            }
            if fn_ & 1 == 1 || fn_ == sn {
                fr = self.hasher.hash_children(c, &fr);
                sr = self.hasher.hash_children(c, &sr);
                if fn_ & 1 == 0 {
                    while fn_ & 1 == 0 && fn_ != 0 {
                        fn_ >>= 1;
                        sn >>= 1;
                    }
                }
            } else {
                sr = self.hasher.hash_children(&sr, c);
            }
            fn_ >>= 1;
            sn >>= 1;
        }

        if sn != 0 {
            return Err("consistency path too short".into());
        }
        if fr != first_hash {
            return Err("proof does not reproduce the trusted root".into());
        }
        if sr != second_hash {
            return Err("proof does not reproduce the new root".into());
        }
        Ok(())
    }
}

//! Merkle tree primitives shared by the log client, the verifier and the PCA
//!
//! Hashing follows RFC 6962: leaves are hashed as `H(0x00 || data)` and
//! interior nodes as `H(0x01 || left || right)`, so a leaf can never be
//! confused with an interior node.

use crate::crypto::{serde_bytes_base64, KeyPair, PublicKey};
use crate::error::{FpkiError, Result};
use base64::{engine::general_purpose::URL_SAFE, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Hash function used to build and verify log trees
pub trait LogHasher: Send + Sync + fmt::Debug {
    /// Hash of an empty tree
    fn empty_root(&self) -> Vec<u8>;

    /// Hash of a leaf's content
    fn hash_leaf(&self, data: &[u8]) -> Vec<u8>;

    /// Hash of an interior node from its children
    fn hash_children(&self, left: &[u8], right: &[u8]) -> Vec<u8>;

    /// Output length in bytes
    fn size(&self) -> usize;
}

/// SHA-256 hasher with RFC 6962 domain separation
#[derive(Debug, Clone, Copy, Default)]
pub struct Rfc6962Hasher;

impl LogHasher for Rfc6962Hasher {
    fn empty_root(&self) -> Vec<u8> {
        Sha256::digest([]).to_vec()
    }

    fn hash_leaf(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update([LEAF_PREFIX]);
        hasher.update(data);
        hasher.finalize().to_vec()
    }

    fn hash_children(&self, left: &[u8], right: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update([NODE_PREFIX]);
        hasher.update(left);
        hasher.update(right);
        hasher.finalize().to_vec()
    }

    fn size(&self) -> usize {
        32
    }
}

/// Identifier of a leaf: URL-safe base64 of its RFC 6962 leaf hash
///
/// Results from concurrent workers are correlated by this key rather than by
/// submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeafKey(String);

impl LeafKey {
    pub fn from_leaf_hash(leaf_hash: &[u8]) -> Self {
        Self(URL_SAFE.encode(leaf_hash))
    }

    pub fn for_leaf(leaf: &[u8]) -> Self {
        Self::from_leaf_hash(&Rfc6962Hasher.hash_leaf(leaf))
    }

    pub fn leaf_hash(&self) -> Result<Vec<u8>> {
        URL_SAFE
            .decode(&self.0)
            .map_err(|e| FpkiError::SerializationError(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeafKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded tree head of the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRoot {
    pub tree_size: u64,

    #[serde(with = "serde_bytes_base64")]
    pub root_hash: Vec<u8>,

    pub timestamp: DateTime<Utc>,

    /// Log signature over the encoded tree head, empty if unsigned
    #[serde(default, with = "serde_bytes_base64")]
    pub signature: Vec<u8>,
}

/// Tree head fields covered by the log's signature
#[derive(Debug, Serialize, Deserialize)]
struct LogRootBody {
    tree_size: u64,
    #[serde(with = "serde_bytes_base64")]
    root_hash: Vec<u8>,
    timestamp: DateTime<Utc>,
}

impl LogRoot {
    /// Root of the empty tree; the starting point for trust on first use
    pub fn empty(hasher: &dyn LogHasher) -> Self {
        Self {
            tree_size: 0,
            root_hash: hasher.empty_root(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            signature: Vec::new(),
        }
    }

    /// Decode a signed root as returned by the log backend
    pub fn from_signed(signed: &SignedLogRoot) -> Result<Self> {
        let body: LogRootBody = serde_json::from_slice(&signed.log_root)?;
        Ok(Self {
            tree_size: body.tree_size,
            root_hash: body.root_hash,
            timestamp: body.timestamp,
            signature: signed.signature.clone(),
        })
    }

    /// Re-encode into the signed wire form
    pub fn to_signed(&self) -> Result<SignedLogRoot> {
        Ok(SignedLogRoot {
            log_root: self.body_bytes()?,
            signature: self.signature.clone(),
        })
    }

    fn body_bytes(&self) -> Result<Vec<u8>> {
        let body = LogRootBody {
            tree_size: self.tree_size,
            root_hash: self.root_hash.clone(),
            timestamp: self.timestamp,
        };
        serde_json::to_vec(&body).map_err(FpkiError::from)
    }
}

/// Signed tree head as produced by the log backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLogRoot {
    /// Encoded `{tree_size, root_hash, timestamp}`
    #[serde(with = "serde_bytes_base64")]
    pub log_root: Vec<u8>,

    #[serde(with = "serde_bytes_base64")]
    pub signature: Vec<u8>,
}

impl SignedLogRoot {
    /// Encode and sign a tree head
    pub fn sign(
        tree_size: u64,
        root_hash: Vec<u8>,
        timestamp: DateTime<Utc>,
        key: &KeyPair,
    ) -> Result<Self> {
        let log_root = serde_json::to_vec(&LogRootBody {
            tree_size,
            root_hash,
            timestamp,
        })?;
        let signature = key.sign(&log_root)?;
        Ok(Self { log_root, signature })
    }

    /// Verify the log's signature over the encoded tree head
    pub fn verify(&self, log_key: &PublicKey) -> Result<()> {
        log_key.verify(&self.log_root, &self.signature)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(FpkiError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(FpkiError::from)
    }
}

/// Audit path proving a leaf is included in a tree of a given size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub leaf_index: u64,

    #[serde(with = "serde_hash_list")]
    pub hashes: Vec<Vec<u8>>,
}

/// Proof that a tree of `second_size` extends a tree of `first_size`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyProof {
    pub first_size: u64,
    pub second_size: u64,

    #[serde(with = "serde_hash_list")]
    pub hashes: Vec<Vec<u8>>,
}

mod serde_hash_list {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(hashes: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(hashes.iter().map(|h| STANDARD.encode(h)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Append-only Merkle tree held entirely in memory
///
/// Reference construction from RFC 6962 §2.1, used by the in-memory log
/// backend and by tests to produce proofs the verifier must accept. It
/// recomputes subtrees on demand and is not meant for large logs.
#[derive(Debug, Default)]
pub struct MerkleTree<H: LogHasher = Rfc6962Hasher> {
    hasher: H,
    leaf_hashes: Vec<Vec<u8>>,
}

impl MerkleTree<Rfc6962Hasher> {
    pub fn new() -> Self {
        Self::with_hasher(Rfc6962Hasher)
    }
}

impl<H: LogHasher> MerkleTree<H> {
    pub fn with_hasher(hasher: H) -> Self {
        Self {
            hasher,
            leaf_hashes: Vec::new(),
        }
    }

    /// Append a leaf, returning its index
    pub fn push(&mut self, leaf: &[u8]) -> u64 {
        self.leaf_hashes.push(self.hasher.hash_leaf(leaf));
        (self.leaf_hashes.len() - 1) as u64
    }

    pub fn len(&self) -> u64 {
        self.leaf_hashes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_hashes.is_empty()
    }

    /// Indices of every leaf with this hash
    pub fn find(&self, leaf_hash: &[u8]) -> Vec<u64> {
        self.leaf_hashes
            .iter()
            .enumerate()
            .filter(|(_, h)| h.as_slice() == leaf_hash)
            .map(|(i, _)| i as u64)
            .collect()
    }

    /// Root hash of the current tree
    pub fn root(&self) -> Vec<u8> {
        self.subtree_root(&self.leaf_hashes)
    }

    /// Root hash of the tree as it was at `size` leaves
    pub fn root_at(&self, size: u64) -> Option<Vec<u8>> {
        let size = usize::try_from(size).ok()?;
        (size <= self.leaf_hashes.len()).then(|| self.subtree_root(&self.leaf_hashes[..size]))
    }

    /// Audit path for `index` in the tree of `size` leaves
    pub fn inclusion_proof(&self, index: u64, size: u64) -> Option<InclusionProof> {
        let (index_usize, size_usize) = (usize::try_from(index).ok()?, usize::try_from(size).ok()?);
        if index_usize >= size_usize || size_usize > self.leaf_hashes.len() {
            return None;
        }
        Some(InclusionProof {
            leaf_index: index,
            hashes: self.path(index_usize, &self.leaf_hashes[..size_usize]),
        })
    }

    /// Consistency proof from the tree of `first` leaves to the one of `second`
    pub fn consistency_proof(&self, first: u64, second: u64) -> Option<ConsistencyProof> {
        let (m, n) = (usize::try_from(first).ok()?, usize::try_from(second).ok()?);
        if m > n || n > self.leaf_hashes.len() {
            return None;
        }
        let hashes = if m == 0 || m == n {
            Vec::new()
        } else {
            self.subproof(m, &self.leaf_hashes[..n], true)
        };
        Some(ConsistencyProof {
            first_size: first,
            second_size: second,
            hashes,
        })
    }

    fn subtree_root(&self, leaves: &[Vec<u8>]) -> Vec<u8> {
        match leaves.len() {
            0 => self.hasher.empty_root(),
            1 => leaves[0].clone(),
            n => {
                let k = split_point(n);
                let left = self.subtree_root(&leaves[..k]);
                let right = self.subtree_root(&leaves[k..]);
                self.hasher.hash_children(&left, &right)
            }
        }
    }

    fn path(&self, m: usize, leaves: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let n = leaves.len();
        if n <= 1 {
            return Vec::new();
        }
        let k = split_point(n);
        if m < k {
            let mut path = self.path(m, &leaves[..k]);
            path.push(self.subtree_root(&leaves[k..]));
            path
        } else {
            let mut path = self.path(m - k, &leaves[k..]);
            path.push(self.subtree_root(&leaves[..k]));
            path
        }
    }

    fn subproof(&self, m: usize, leaves: &[Vec<u8>], complete: bool) -> Vec<Vec<u8>> {
        let n = leaves.len();
        if m == n {
            return if complete {
                Vec::new()
            } else {
                vec![self.subtree_root(leaves)]
            };
        }
        let k = split_point(n);
        if m <= k {
            let mut proof = self.subproof(m, &leaves[..k], complete);
            proof.push(self.subtree_root(&leaves[k..]));
            proof
        } else {
            let mut proof = self.subproof(m - k, &leaves[k..], false);
            proof.push(self.subtree_root(&leaves[..k]));
            proof
        }
    }
}

/// Largest power of two strictly smaller than `n` (n > 1)
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k << 1 < n {
        k <<= 1;
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_and_node_hashes_are_domain_separated() {
        let h = Rfc6962Hasher;
        let leaf = h.hash_leaf(b"");
        // RFC 6962 test vector for the empty leaf
        assert_eq!(
            hex::encode(&leaf),
            "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d"
        );
        assert_ne!(h.hash_children(b"", b""), leaf);
    }

    #[test]
    fn test_empty_tree_root() {
        let tree = MerkleTree::new();
        assert_eq!(
            hex::encode(tree.root()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_root_at_matches_historic_root() {
        let mut tree = MerkleTree::new();
        let mut roots = Vec::new();
        for i in 0..9u8 {
            tree.push(&[i]);
            roots.push(tree.root());
        }
        for (i, root) in roots.iter().enumerate() {
            assert_eq!(tree.root_at(i as u64 + 1).as_ref(), Some(root));
        }
        assert!(tree.root_at(10).is_none());
    }

    #[test]
    fn test_proof_shapes() {
        let mut tree = MerkleTree::new();
        for i in 0..7u8 {
            tree.push(&[i]);
        }
        // 7 leaves: depth 3 for the left subtree of 4
        assert_eq!(tree.inclusion_proof(0, 7).unwrap().hashes.len(), 3);
        assert!(tree.inclusion_proof(7, 7).is_none());
        assert!(tree.consistency_proof(3, 7).unwrap().hashes.len() > 0);
        assert!(tree.consistency_proof(7, 7).unwrap().hashes.is_empty());
        assert!(tree.consistency_proof(8, 7).is_none());
    }

    #[test]
    fn test_leaf_key_roundtrip() {
        let key = LeafKey::for_leaf(b"leaf");
        assert_eq!(key.leaf_hash().unwrap(), Rfc6962Hasher.hash_leaf(b"leaf"));
    }

    #[test]
    fn test_signed_root_roundtrip_and_signature() {
        let key = KeyPair::generate().unwrap();
        let signed = SignedLogRoot::sign(3, vec![7u8; 32], Utc::now(), &key).unwrap();
        signed.verify(&key.public_key()).unwrap();

        let root = LogRoot::from_signed(&signed).unwrap();
        assert_eq!(root.tree_size, 3);
        assert_eq!(root.to_signed().unwrap(), signed);
    }
}

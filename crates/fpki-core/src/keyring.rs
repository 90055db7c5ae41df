//! Key rotation for domain owners and issuers
//!
//! A `KeyRing` holds the current signing key and the one it replaced. The
//! previous key is what proves continuity to the PCA: a request signed with
//! it shows the requester controlled the key of the already-valid
//! certificate.

use crate::crypto::KeyPair;
use crate::error::Result;
use tracing::debug;

/// Current key plus the immediately previous one
#[derive(Debug, Default)]
pub struct KeyRing {
    current: Option<KeyPair>,
    previous: Option<KeyPair>,
}

impl KeyRing {
    /// Create an empty key ring
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a key ring whose current key is already known
    pub fn with_current(current: KeyPair) -> Self {
        Self {
            current: Some(current),
            previous: None,
        }
    }

    /// Generate a fresh key, demoting the current one to `previous`
    ///
    /// The key older than `previous` is dropped. On failure the ring is left
    /// untouched.
    pub fn rotate(&mut self) -> Result<&KeyPair> {
        let fresh = KeyPair::generate()?;
        self.previous = self.current.take();

        debug!(
            had_previous = self.previous.is_some(),
            "Rotated key ring"
        );

        Ok(self.current.insert(fresh))
    }

    pub fn current(&self) -> Option<&KeyPair> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&KeyPair> {
        self.previous.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ring_is_empty() {
        let ring = KeyRing::new();
        assert!(ring.current().is_none());
        assert!(ring.previous().is_none());
    }

    #[test]
    fn test_rotate_demotes_current() {
        let mut ring = KeyRing::new();

        let first = ring.rotate().unwrap().public_key();
        assert!(ring.previous().is_none());

        let second = ring.rotate().unwrap().public_key();
        assert_ne!(first, second);
        assert_eq!(ring.previous().unwrap().public_key(), first);
        assert_eq!(ring.current().unwrap().public_key(), second);
    }

    #[test]
    fn test_previous_is_only_inherited() {
        let mut ring = KeyRing::new();
        ring.rotate().unwrap();
        ring.rotate().unwrap();
        let second = ring.current().unwrap().public_key();
        ring.rotate().unwrap();

        // The first key is gone; previous is always the last current.
        assert_eq!(ring.previous().unwrap().public_key(), second);
    }
}

//! Cryptographic primitives for policy objects
//!
//! RSA-2048 keys with SHA-256 PKCS#1 v1.5 signatures, the only algorithm pair
//! F-PKI policy objects currently carry. Public keys travel as PEM-encoded
//! SubjectPublicKeyInfo bytes so they can be embedded in requests and
//! certificates verbatim.
//!
//! Key types:
//! - `KeyPair`: private key used by domain owners and the PCA to sign
//! - `PublicKey`: verification key decoded from an embedded PEM blob

use crate::error::{FpkiError, Result};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Modulus size for every generated key
pub const RSA_KEY_BITS: u32 = 2048;

/// Public key algorithm carried in requests and certificates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicKeyAlgorithm {
    #[default]
    Rsa,
}

/// Signature algorithm carried in requests and certificates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    #[default]
    RsaSha256,
}

/// RSA key pair for signing requests and certificates
#[derive(Clone)]
pub struct KeyPair {
    pkey: PKey<Private>,
    public: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("fingerprint", &self.public.fingerprint())
            .field("private_key", &"[redacted]")
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh RSA-2048 key pair
    pub fn generate() -> Result<Self> {
        let rsa = Rsa::generate(RSA_KEY_BITS)
            .map_err(|e| FpkiError::KeyGeneration(e.to_string()))?;
        let pkey = PKey::from_rsa(rsa).map_err(|e| FpkiError::KeyGeneration(e.to_string()))?;
        Self::from_pkey(pkey).map_err(|e| FpkiError::KeyGeneration(e.to_string()))
    }

    /// Load a key pair from a PEM-encoded private key
    pub fn from_private_pem(pem: &[u8]) -> Result<Self> {
        let pkey = PKey::private_key_from_pem(pem)
            .map_err(|e| FpkiError::InvalidKey(e.to_string()))?;
        Self::from_pkey(pkey)
    }

    fn from_pkey(pkey: PKey<Private>) -> Result<Self> {
        let public_pem = pkey
            .public_key_to_pem()
            .map_err(|e| FpkiError::InvalidKey(e.to_string()))?;
        let public = PublicKey::from_pem(&public_pem)?;
        Ok(Self { pkey, public })
    }

    /// Export the private key as PKCS#8 PEM
    pub fn private_key_to_pem(&self) -> Result<Vec<u8>> {
        self.pkey
            .private_key_to_pem_pkcs8()
            .map_err(|e| FpkiError::InvalidKey(e.to_string()))
    }

    /// PEM bytes of the public half, as embedded in requests
    pub fn public_key_pem(&self) -> &[u8] {
        self.public.to_pem()
    }

    /// Get the public key
    pub fn public_key(&self) -> PublicKey {
        self.public.clone()
    }

    /// Sign `data` with SHA-256 / PKCS#1 v1.5
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)
            .map_err(|e| FpkiError::Signing(e.to_string()))?;
        signer
            .sign_oneshot_to_vec(data)
            .map_err(|e| FpkiError::Signing(e.to_string()))
    }
}

/// RSA public key for verification
#[derive(Clone)]
pub struct PublicKey {
    pkey: PKey<Public>,
    pem: Vec<u8>,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.pem == other.pem
    }
}

impl Eq for PublicKey {}

impl PublicKey {
    /// Decode a PEM-encoded SubjectPublicKeyInfo
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let pkey = PKey::public_key_from_pem(pem)
            .map_err(|e| FpkiError::InvalidKey(e.to_string()))?;
        if pkey.rsa().is_err() {
            return Err(FpkiError::InvalidKey("key type is not RSA".into()));
        }
        Ok(Self {
            pkey,
            pem: pem.to_vec(),
        })
    }

    /// The PEM bytes this key was decoded from
    pub fn to_pem(&self) -> &[u8] {
        &self.pem
    }

    /// Hex SHA-256 over the PEM bytes, used to identify keys in logs
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.pem))
    }

    /// Verify a SHA-256 / PKCS#1 v1.5 signature over `data`
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let mut verifier = Verifier::new(MessageDigest::sha256(), &self.pkey)
            .map_err(|e| FpkiError::InvalidSignature(e.to_string()))?;
        // openssl reports malformed signatures as errors; treat them as a mismatch.
        let verified = verifier.verify_oneshot(signature, data).unwrap_or(false);

        if verified {
            Ok(())
        } else {
            Err(FpkiError::InvalidSignature(format!(
                "signature does not verify under key {}",
                self.fingerprint()
            )))
        }
    }
}

/// SHA-256 digest helper
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Base64 serialization for signature and key bytes
pub(crate) mod serde_bytes_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }

    /// Same encoding for optional fields
    pub mod option {
        use super::*;

        pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = KeyPair::generate().unwrap();
        assert!(kp.public_key_pem().starts_with(b"-----BEGIN PUBLIC KEY-----"));
        assert_eq!(kp.public_key().fingerprint().len(), 64);
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate().unwrap();
        let sig = kp.sign(b"policy certificate").unwrap();

        // 2048-bit modulus
        assert_eq!(sig.len(), 256);
        kp.public_key().verify(b"policy certificate", &sig).unwrap();
    }

    #[test]
    fn test_verify_through_pem() {
        let kp = KeyPair::generate().unwrap();
        let sig = kp.sign(b"payload").unwrap();

        let pk = PublicKey::from_pem(kp.public_key_pem()).unwrap();
        assert!(pk.verify(b"payload", &sig).is_ok());
        assert_eq!(pk, kp.public_key());
    }

    #[test]
    fn test_verification_fails_with_wrong_key() {
        let kp1 = KeyPair::generate().unwrap();
        let kp2 = KeyPair::generate().unwrap();
        let sig = kp1.sign(b"payload").unwrap();

        let result = kp2.public_key().verify(b"payload", &sig);
        assert!(matches!(result, Err(FpkiError::InvalidSignature(_))));
    }

    #[test]
    fn test_garbage_signature_is_a_mismatch() {
        let kp = KeyPair::generate().unwrap();
        let result = kp.public_key().verify(b"payload", &[0u8; 7]);
        assert!(matches!(result, Err(FpkiError::InvalidSignature(_))));
    }

    #[test]
    fn test_private_pem_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let pem = kp.private_key_to_pem().unwrap();
        let restored = KeyPair::from_private_pem(&pem).unwrap();
        assert_eq!(restored.public_key_pem(), kp.public_key_pem());
    }

    #[test]
    fn test_garbage_public_key_rejected() {
        let result = PublicKey::from_pem(b"not a key");
        assert!(matches!(result, Err(FpkiError::InvalidKey(_))));
    }
}

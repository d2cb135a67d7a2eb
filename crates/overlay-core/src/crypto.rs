//! Ed25519 signing and SHA-256 hashing for the distributed-data layer.
//!
//! Publishers sign the serialized payload bytes; verifiers check the
//! signature against the raw public key. Keys are referenced elsewhere by
//! their SHA-256 hash, never by the raw bytes.

use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Signature verification failed")]
    VerificationFailed,
}

/// SHA-256 of arbitrary bytes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// SHA-256 of a public key, used for membership checks in authorized key
/// sets and for sender-key bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHash([u8; 32]);

impl KeyHash {
    pub fn of_public_key(public_key: &[u8]) -> Self {
        Self(sha256(public_key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for KeyHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Ed25519 keypair for signing distributed data.
pub struct Keypair {
    signing_key: ed25519_dalek::SigningKey,
}

impl Keypair {
    /// Generate a random keypair.
    pub fn generate() -> Self {
        use rand::Rng;
        let seed: [u8; 32] = rand::rng().random();
        Self::from_seed(seed)
    }

    /// Create from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    /// Raw public key bytes (32 bytes).
    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }

    /// Hash of the public key.
    pub fn key_hash(&self) -> KeyHash {
        KeyHash::of_public_key(&self.public_key())
    }

    /// Sign a message. Ed25519 signing is deterministic, no RNG needed.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        use ed25519_dalek::Signer;
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Verify an Ed25519 signature against raw public key bytes.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    use ed25519_dalek::Verifier;

    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| CryptoError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = Keypair::generate();
        let message = b"gossip payload";

        let signature = keypair.sign(message);
        assert!(verify_signature(&keypair.public_key(), message, &signature).is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"message one");

        let result = verify_signature(&keypair.public_key(), b"message two", &signature);
        assert_eq!(result, Err(CryptoError::VerificationFailed));
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair1 = Keypair::generate();
        let keypair2 = Keypair::generate();

        let signature = keypair1.sign(b"test");
        let result = verify_signature(&keypair2.public_key(), b"test", &signature);
        assert_eq!(result, Err(CryptoError::VerificationFailed));
    }

    #[test]
    fn test_deterministic_signatures() {
        let keypair = Keypair::from_seed([0xAB; 32]);

        let sig1 = keypair.sign(b"deterministic");
        let sig2 = keypair.sign(b"deterministic");
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn test_malformed_key_rejected() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"test");

        assert_eq!(
            verify_signature(&[1, 2, 3], b"test", &signature),
            Err(CryptoError::InvalidPublicKey)
        );
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let keypair = Keypair::generate();

        assert_eq!(
            verify_signature(&keypair.public_key(), b"test", &[0u8; 10]),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_key_hash_stable() {
        let keypair = Keypair::from_seed([7; 32]);
        let h1 = KeyHash::of_public_key(&keypair.public_key());
        let h2 = keypair.key_hash();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_key_hash_distinct_keys() {
        let h1 = Keypair::from_seed([1; 32]).key_hash();
        let h2 = Keypair::from_seed([2; 32]).key_hash();
        assert_ne!(h1, h2);
    }
}

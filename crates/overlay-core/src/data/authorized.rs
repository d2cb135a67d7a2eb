//! Data requiring a signature from a permitted key set.
//!
//! Authorized data carries privileged records (filters, role grants,
//! oracle announcements) that only a known set of publishers may emit.
//! The permitted set is injected via [`AuthorizedKeys`] so deployments and
//! test networks can differ without code branches.

use super::DistributedData;
use crate::crypto::{self, KeyHash, Keypair};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Provider of the permitted key-hash set.
///
/// Implementations: a fixed deploy-time set, a well-known test set, or a
/// dynamically updated set maintained by a higher layer.
pub trait AuthorizedKeys: Send + Sync {
    fn contains(&self, key_hash: &KeyHash) -> bool;
}

/// A fixed set of authorized key hashes.
#[derive(Default)]
pub struct StaticAuthorizedKeys {
    hashes: HashSet<KeyHash>,
}

impl StaticAuthorizedKeys {
    pub fn new(hashes: impl IntoIterator<Item = KeyHash>) -> Self {
        Self {
            hashes: hashes.into_iter().collect(),
        }
    }

    /// Build from raw public keys.
    pub fn from_public_keys<'a>(keys: impl IntoIterator<Item = &'a [u8]>) -> Self {
        Self::new(keys.into_iter().map(KeyHash::of_public_key))
    }
}

impl AuthorizedKeys for StaticAuthorizedKeys {
    fn contains(&self, key_hash: &KeyHash) -> bool {
        self.hashes.contains(key_hash)
    }
}

/// A [`DistributedData`] record plus a signature provable against the
/// authorized key set.
///
/// Invalid if the signing key's hash is not a member of the permitted set
/// or the signature does not verify over the serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedData {
    pub data: DistributedData,
    /// Raw public key the signature was made with.
    pub authorizing_key: Vec<u8>,
    /// Signature over `data.serialize()`.
    pub signature: Vec<u8>,
}

impl AuthorizedData {
    /// Sign a record with an (allegedly) authorized keypair.
    pub fn sign(data: DistributedData, keypair: &Keypair) -> Self {
        let signature = keypair.sign(&data.serialize());
        Self {
            data,
            authorizing_key: keypair.public_key(),
            signature,
        }
    }

    pub fn key_hash(&self) -> KeyHash {
        KeyHash::of_public_key(&self.authorizing_key)
    }

    /// True if the record must be discarded: key not permitted, or the
    /// signature does not verify against the exact serialized payload.
    pub fn is_data_invalid(&self, authorized: &dyn AuthorizedKeys) -> bool {
        if self.data.is_data_invalid() {
            return true;
        }
        if !authorized.contains(&self.key_hash()) {
            return true;
        }
        crypto::verify_signature(&self.authorizing_key, &self.data.serialize(), &self.signature)
            .is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataTag, MetaData};
    use std::time::Duration;

    fn sample_data() -> DistributedData {
        DistributedData::new(
            vec![42; 16],
            MetaData::new(Duration::from_secs(60), 512, DataTag::new("roles", "Grant")),
        )
    }

    #[test]
    fn test_authorized_key_accepted() {
        let keypair = Keypair::generate();
        let keys = StaticAuthorizedKeys::new([keypair.key_hash()]);

        let auth = AuthorizedData::sign(sample_data(), &keypair);
        assert!(!auth.is_data_invalid(&keys));
    }

    #[test]
    fn test_unauthorized_key_rejected() {
        let keypair = Keypair::generate();
        let keys = StaticAuthorizedKeys::new([]); // empty permitted set

        // Signature itself is valid, but the key is not permitted.
        let auth = AuthorizedData::sign(sample_data(), &keypair);
        assert!(auth.is_data_invalid(&keys));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let keypair = Keypair::generate();
        let keys = StaticAuthorizedKeys::new([keypair.key_hash()]);

        let mut auth = AuthorizedData::sign(sample_data(), &keypair);
        auth.data.payload[0] ^= 1; // one byte flipped after signing
        assert!(auth.is_data_invalid(&keys));
    }

    #[test]
    fn test_structurally_invalid_rejected_before_crypto() {
        let keypair = Keypair::generate();
        let keys = StaticAuthorizedKeys::new([keypair.key_hash()]);

        let mut data = sample_data();
        data.meta.ttl = Duration::ZERO;
        let auth = AuthorizedData::sign(data, &keypair);
        assert!(auth.is_data_invalid(&keys));
    }

    #[test]
    fn test_from_public_keys() {
        let keypair = Keypair::generate();
        let public_key = keypair.public_key();
        let keys = StaticAuthorizedKeys::from_public_keys([public_key.as_slice()]);
        assert!(keys.contains(&keypair.key_hash()));
    }
}

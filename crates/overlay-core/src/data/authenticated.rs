//! Data bound to a self-declared sender key.
//!
//! Anyone may publish authenticated data; the point of the wrapper is that
//! the first-seen key binds the record identity, so a later publisher
//! cannot hijack it with a different key.

use super::DistributedData;
use crate::crypto::{self, KeyHash, Keypair};
use serde::{Deserialize, Serialize};

/// A [`DistributedData`] record plus the publisher's public key and a
/// signature over the serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedData {
    pub data: DistributedData,
    /// Raw public key of the sender.
    pub sender_key: Vec<u8>,
    /// Signature over `data.serialize()`.
    pub signature: Vec<u8>,
}

impl AuthenticatedData {
    /// Sign a record with the sender's keypair.
    pub fn sign(data: DistributedData, keypair: &Keypair) -> Self {
        let signature = keypair.sign(&data.serialize());
        Self {
            data,
            sender_key: keypair.public_key(),
            signature,
        }
    }

    /// Hash of the declared sender key, used for identity bindings.
    pub fn sender_key_hash(&self) -> KeyHash {
        KeyHash::of_public_key(&self.sender_key)
    }

    /// True if the signature does not verify against the declared key.
    pub fn is_signature_invalid(&self) -> bool {
        crypto::verify_signature(&self.sender_key, &self.data.serialize(), &self.signature)
            .is_err()
    }
}

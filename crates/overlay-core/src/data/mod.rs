//! Distributed-data records and their admission model.
//!
//! A [`DistributedData`] record is an opaque application payload plus the
//! metadata the overlay needs to police it: a TTL, a size bound, and a type
//! tag for decoder dispatch. Records are wrapped either as
//! [`AuthenticatedData`] (bound to a self-declared sender key) or
//! [`AuthorizedData`] (requiring a signature from a permitted key set)
//! before they are gossiped.
//!
//! Nothing in this module stores or forwards anything; admission decisions
//! live in [`admission`].

pub mod admission;
pub mod authenticated;
pub mod authorized;
pub mod registry;
pub mod service;

pub use admission::{AdmissionService, DataStore, InMemoryDataStore, RejectReason};
pub use authenticated::AuthenticatedData;
pub use authorized::{AuthorizedData, AuthorizedKeys, StaticAuthorizedKeys};
pub use registry::{DecodeError, DecoderRegistry};
pub use service::{DataGossipService, PublishError};

use crate::crypto::sha256;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Hard ceiling for record TTLs (30 days).
pub const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Hard ceiling for a single record's declared max size.
pub const MAX_DATA_SIZE: usize = 1_000_000;

/// Longest accepted package/name component of a data tag.
pub const MAX_TAG_LEN: usize = 100;

/// Type class identifier: a (package, name) pair resolved to a typed
/// decoder via [`DecoderRegistry`]. No runtime reflection involved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataTag {
    pub package: String,
    pub name: String,
}

impl DataTag {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }
}

impl Display for DataTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.package, self.name)
    }
}

/// Metadata attached to every distributed-data record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    /// Maximum lifetime before mandatory expiry.
    pub ttl: Duration,
    /// Declared upper bound for the payload size in bytes.
    pub max_size: usize,
    /// Type class of the payload.
    pub tag: DataTag,
}

impl MetaData {
    pub fn new(ttl: Duration, max_size: usize, tag: DataTag) -> Self {
        Self { ttl, max_size, tag }
    }
}

/// An application payload eligible for gossip and storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedData {
    /// Opaque serialized application payload.
    pub payload: Vec<u8>,
    pub meta: MetaData,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

impl DistributedData {
    pub fn new(payload: Vec<u8>, meta: MetaData) -> Self {
        Self {
            payload,
            meta,
            created_at_ms: now_ms(),
        }
    }

    /// The exact bytes publishers sign and verifiers check.
    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("DistributedData serialization should not fail")
    }

    /// Structural validity gate; must hold before a record is admitted.
    ///
    /// Covers TTL sanity, size bounds, and tag field limits. A true result
    /// means the record must be discarded, never stored or rebroadcast.
    pub fn is_data_invalid(&self) -> bool {
        if self.meta.ttl.is_zero() || self.meta.ttl > MAX_TTL {
            return true;
        }
        if self.meta.max_size == 0 || self.meta.max_size > MAX_DATA_SIZE {
            return true;
        }
        if self.payload.len() > self.meta.max_size {
            return true;
        }
        let tag = &self.meta.tag;
        if tag.package.is_empty() || tag.package.len() > MAX_TAG_LEN {
            return true;
        }
        if tag.name.is_empty() || tag.name.len() > MAX_TAG_LEN {
            return true;
        }
        false
    }

    /// Check whether the record's TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        let age_ms = now_ms().saturating_sub(self.created_at_ms);
        Duration::from_millis(age_ms) > self.meta.ttl
    }
}

/// Content identity of a record: SHA-256 over its serialized bytes.
///
/// Storage keys, sequence tracking, and sender-key bindings are all
/// per-`DataId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataId([u8; 32]);

impl DataId {
    pub fn of(data: &DistributedData) -> Self {
        Self(sha256(&data.serialize()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for DataId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A record in one of its trust wrappings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataEntry {
    /// No publisher identity attached; append-only.
    Plain(DistributedData),
    /// Bound to a self-declared sender key (first-seen binding).
    Authenticated(AuthenticatedData),
    /// Requires a signature from the authorized key set.
    Authorized(AuthorizedData),
}

impl DataEntry {
    pub fn data(&self) -> &DistributedData {
        match self {
            Self::Plain(data) => data,
            Self::Authenticated(auth) => &auth.data,
            Self::Authorized(auth) => &auth.data,
        }
    }

    pub fn id(&self) -> DataId {
        DataId::of(self.data())
    }
}

/// Request to admit a record, gossiped between nodes.
///
/// The sequence number increases with every re-publication of the same
/// record identity; stale sequence numbers are rejected so late or replayed
/// adds cannot resurrect removed data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDataRequest {
    pub entry: DataEntry,
    pub sequence: u64,
}

/// Request to remove a record, signed by the owning key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDataRequest {
    pub id: DataId,
    pub sequence: u64,
    /// Raw public key of the requester.
    pub public_key: Vec<u8>,
    /// Signature over [`RemoveDataRequest::signed_bytes`].
    pub signature: Vec<u8>,
}

impl RemoveDataRequest {
    /// The bytes the remove signature covers: record id plus sequence.
    pub fn signed_bytes(id: &DataId, sequence: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(40);
        bytes.extend_from_slice(id.as_bytes());
        bytes.extend_from_slice(&sequence.to_be_bytes());
        bytes
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta() -> MetaData {
        MetaData::new(
            Duration::from_secs(600),
            1024,
            DataTag::new("exchange", "Offer"),
        )
    }

    #[test]
    fn test_valid_data() {
        let data = DistributedData::new(vec![1, 2, 3], test_meta());
        assert!(!data.is_data_invalid());
        assert!(!data.is_expired());
    }

    #[test]
    fn test_oversized_payload_invalid() {
        let mut meta = test_meta();
        meta.max_size = 4;
        let data = DistributedData::new(vec![0; 5], meta);
        assert!(data.is_data_invalid());
    }

    #[test]
    fn test_zero_ttl_invalid() {
        let mut meta = test_meta();
        meta.ttl = Duration::ZERO;
        assert!(DistributedData::new(vec![], meta).is_data_invalid());
    }

    #[test]
    fn test_excessive_ttl_invalid() {
        let mut meta = test_meta();
        meta.ttl = MAX_TTL + Duration::from_secs(1);
        assert!(DistributedData::new(vec![], meta).is_data_invalid());
    }

    #[test]
    fn test_excessive_declared_size_invalid() {
        let mut meta = test_meta();
        meta.max_size = MAX_DATA_SIZE + 1;
        assert!(DistributedData::new(vec![], meta).is_data_invalid());
    }

    #[test]
    fn test_empty_tag_invalid() {
        let mut meta = test_meta();
        meta.tag = DataTag::new("", "Offer");
        assert!(DistributedData::new(vec![], meta).is_data_invalid());
    }

    #[test]
    fn test_overlong_tag_invalid() {
        let mut meta = test_meta();
        meta.tag = DataTag::new("exchange", "x".repeat(MAX_TAG_LEN + 1));
        assert!(DistributedData::new(vec![], meta).is_data_invalid());
    }

    #[test]
    fn test_expiry() {
        let mut data = DistributedData::new(vec![], test_meta());
        data.created_at_ms = 0; // far in the past
        assert!(data.is_expired());
    }

    #[test]
    fn test_data_id_is_content_hash() {
        let data = DistributedData::new(vec![1, 2, 3], test_meta());
        let same = data.clone();
        assert_eq!(DataId::of(&data), DataId::of(&same));

        let mut different = data.clone();
        different.payload[0] ^= 1;
        assert_ne!(DataId::of(&data), DataId::of(&different));
    }

    #[test]
    fn test_entry_id_matches_inner_data() {
        let data = DistributedData::new(vec![9], test_meta());
        let entry = DataEntry::Plain(data.clone());
        assert_eq!(entry.id(), DataId::of(&data));
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(DataTag::new("exchange", "Offer").to_string(), "exchange.Offer");
    }
}

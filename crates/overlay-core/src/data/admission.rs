//! Admission gate for distributed data.
//!
//! `admit_add` / `admit_remove` must run before any record is stored or
//! forwarded. Rejected data is discarded: never stored, never rebroadcast.
//! Successful admission is the only path by which data becomes eligible for
//! storage and broadcast fan-out.

use super::{
    AddDataRequest, AuthorizedKeys, DataEntry, DataId, RemoveDataRequest,
};
use crate::crypto::{self, KeyHash};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Why a record was refused admission.
///
/// Callers may additionally ban the originating connection for repeated
/// authorization failures; that policy lives above this layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    #[error("Data failed structural validation")]
    DataInvalid,
    #[error("Data TTL has expired")]
    Expired,
    #[error("Sequence number has not increased")]
    StaleSequence,
    #[error("Sender key does not match the recorded binding")]
    SenderKeyMismatch,
    #[error("Signature verification failed")]
    InvalidSignature,
    #[error("Signing key is not in the authorized key set")]
    UnauthorizedKey,
    #[error("Entry kind does not support removal")]
    RemovalNotAllowed,
}

/// Pluggable keyed store for admitted records.
///
/// The overlay only decides what may enter; where admitted records live
/// (disk, database, memory) is the collaborator's concern.
pub trait DataStore: Send + Sync {
    fn put(&self, id: DataId, entry: DataEntry);
    fn get(&self, id: &DataId) -> Option<DataEntry>;
    fn remove(&self, id: &DataId) -> Option<DataEntry>;
    fn ids(&self) -> Vec<DataId>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store used by tests and the daemon.
#[derive(Default)]
pub struct InMemoryDataStore {
    entries: RwLock<HashMap<DataId, DataEntry>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for InMemoryDataStore {
    fn put(&self, id: DataId, entry: DataEntry) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, entry);
    }

    fn get(&self, id: &DataId) -> Option<DataEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn remove(&self, id: &DataId) -> Option<DataEntry> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    fn ids(&self) -> Vec<DataId> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[derive(Debug, Clone, Copy)]
struct SequenceState {
    last: u64,
    tombstoned: bool,
}

/// The admission gate itself.
///
/// Tracks per-record sequence numbers (including tombstones for removed
/// records) and first-seen sender-key bindings. All admission decisions are
/// serialized by the sequence lock, so concurrent gossip from several
/// connections cannot interleave half-applied updates.
pub struct AdmissionService {
    store: Arc<dyn DataStore>,
    authorized_keys: Arc<dyn AuthorizedKeys>,
    sequences: RwLock<HashMap<DataId, SequenceState>>,
    bindings: RwLock<HashMap<DataId, KeyHash>>,
}

impl AdmissionService {
    pub fn new(store: Arc<dyn DataStore>, authorized_keys: Arc<dyn AuthorizedKeys>) -> Self {
        Self {
            store,
            authorized_keys,
            sequences: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Admit an add request.
    ///
    /// Checks, in order: structural validity, expiry, sequence freshness,
    /// then the trust wrapper (key binding for authenticated data, key-set
    /// membership plus signature for authorized data).
    ///
    /// Returns `Ok(true)` if the record is newly stored, `Ok(false)` if the
    /// same record was already present and only its sequence advanced.
    pub fn admit_add(&self, request: &AddDataRequest) -> Result<bool, RejectReason> {
        let data = request.entry.data();
        if data.is_data_invalid() {
            warn!("Data invalid at add: {}", data.meta.tag);
            return Err(RejectReason::DataInvalid);
        }
        if data.is_expired() {
            debug!("Data expired at add: {}", data.meta.tag);
            return Err(RejectReason::Expired);
        }

        let id = request.entry.id();
        let mut sequences = self.sequences.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = sequences.get(&id)
            && request.sequence <= state.last
        {
            debug!("Stale sequence {} at add for {}", request.sequence, id);
            return Err(RejectReason::StaleSequence);
        }

        match &request.entry {
            DataEntry::Plain(_) => {}
            DataEntry::Authenticated(auth) => {
                let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
                if let Some(bound) = bindings.get(&id)
                    && *bound != auth.sender_key_hash()
                {
                    warn!("Sender key mismatch at add for {}", id);
                    return Err(RejectReason::SenderKeyMismatch);
                }
                if auth.is_signature_invalid() {
                    warn!("Signature invalid at add for {}", id);
                    return Err(RejectReason::InvalidSignature);
                }
                // First-seen key binds the identity
                bindings.entry(id).or_insert_with(|| auth.sender_key_hash());
            }
            DataEntry::Authorized(auth) => {
                if !self.authorized_keys.contains(&auth.key_hash()) {
                    warn!("Unauthorized key at add for {}", id);
                    return Err(RejectReason::UnauthorizedKey);
                }
                if crypto::verify_signature(
                    &auth.authorizing_key,
                    &auth.data.serialize(),
                    &auth.signature,
                )
                .is_err()
                {
                    warn!("Signature invalid at add for {}", id);
                    return Err(RejectReason::InvalidSignature);
                }
            }
        }

        let is_new = self.store.get(&id).is_none();
        self.store.put(id, request.entry.clone());
        sequences.insert(
            id,
            SequenceState {
                last: request.sequence,
                tombstoned: false,
            },
        );
        Ok(is_new)
    }

    /// Admit a remove request.
    ///
    /// Removal must be proven by the owning key: the recorded sender-key
    /// binding for authenticated data, a member of the authorized set for
    /// authorized data. Plain records are append-only.
    ///
    /// An unknown id is not an error: the sequence number is recorded as a
    /// tombstone so a late or replayed add cannot resurrect the record.
    /// Returns `Ok(true)` when a stored record was actually removed.
    pub fn admit_remove(&self, request: &RemoveDataRequest) -> Result<bool, RejectReason> {
        let mut sequences = self.sequences.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = sequences.get(&request.id)
            && request.sequence <= state.last
        {
            debug!("Stale sequence at remove for {}", request.id);
            return Err(RejectReason::StaleSequence);
        }

        let Some(entry) = self.store.get(&request.id) else {
            // Keep the sequence so a later add with an older number is refused
            sequences.insert(
                request.id,
                SequenceState {
                    last: request.sequence,
                    tombstoned: true,
                },
            );
            debug!("No entry at remove for {}", request.id);
            return Ok(false);
        };

        let signed = RemoveDataRequest::signed_bytes(&request.id, request.sequence);
        match &entry {
            DataEntry::Plain(_) => return Err(RejectReason::RemovalNotAllowed),
            DataEntry::Authenticated(_) => {
                let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
                let requester = KeyHash::of_public_key(&request.public_key);
                if bindings.get(&request.id) != Some(&requester) {
                    warn!("Public key mismatch at remove for {}", request.id);
                    return Err(RejectReason::SenderKeyMismatch);
                }
            }
            DataEntry::Authorized(_) => {
                let requester = KeyHash::of_public_key(&request.public_key);
                if !self.authorized_keys.contains(&requester) {
                    warn!("Unauthorized key at remove for {}", request.id);
                    return Err(RejectReason::UnauthorizedKey);
                }
            }
        }
        if crypto::verify_signature(&request.public_key, &signed, &request.signature).is_err() {
            warn!("Signature invalid at remove for {}", request.id);
            return Err(RejectReason::InvalidSignature);
        }

        self.store.remove(&request.id);
        sequences.insert(
            request.id,
            SequenceState {
                last: request.sequence,
                tombstoned: true,
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::data::{
        AuthenticatedData, AuthorizedData, DataTag, DistributedData, MetaData,
        StaticAuthorizedKeys,
    };
    use std::time::Duration;

    fn sample_data(payload: &[u8]) -> DistributedData {
        DistributedData::new(
            payload.to_vec(),
            MetaData::new(Duration::from_secs(600), 1024, DataTag::new("chat", "Message")),
        )
    }

    fn service_with_keys(keys: StaticAuthorizedKeys) -> AdmissionService {
        AdmissionService::new(Arc::new(InMemoryDataStore::new()), Arc::new(keys))
    }

    fn service() -> AdmissionService {
        service_with_keys(StaticAuthorizedKeys::new([]))
    }

    fn add_request(entry: DataEntry, sequence: u64) -> AddDataRequest {
        AddDataRequest { entry, sequence }
    }

    fn remove_request(id: DataId, sequence: u64, keypair: &Keypair) -> RemoveDataRequest {
        let signed = RemoveDataRequest::signed_bytes(&id, sequence);
        RemoveDataRequest {
            id,
            sequence,
            public_key: keypair.public_key(),
            signature: keypair.sign(&signed),
        }
    }

    // ==================== Structural checks ====================

    #[test]
    fn test_plain_add_is_stored() {
        let service = service();
        let entry = DataEntry::Plain(sample_data(b"hello"));
        let id = entry.id();

        assert_eq!(service.admit_add(&add_request(entry, 1)), Ok(true));
        assert!(service.store().get(&id).is_some());
    }

    #[test]
    fn test_invalid_data_rejected_and_not_stored() {
        let service = service();
        let mut data = sample_data(b"hello");
        data.meta.ttl = Duration::ZERO;
        let entry = DataEntry::Plain(data);
        let id = entry.id();

        assert_eq!(
            service.admit_add(&add_request(entry, 1)),
            Err(RejectReason::DataInvalid)
        );
        assert!(service.store().get(&id).is_none());
    }

    #[test]
    fn test_expired_data_rejected() {
        let service = service();
        let mut data = sample_data(b"old");
        data.created_at_ms = 0;
        assert_eq!(
            service.admit_add(&add_request(DataEntry::Plain(data), 1)),
            Err(RejectReason::Expired)
        );
    }

    // ==================== Sequence numbers ====================

    #[test]
    fn test_stale_sequence_rejected() {
        let service = service();
        let entry = DataEntry::Plain(sample_data(b"x"));

        assert_eq!(service.admit_add(&add_request(entry.clone(), 5)), Ok(true));
        assert_eq!(
            service.admit_add(&add_request(entry.clone(), 5)),
            Err(RejectReason::StaleSequence)
        );
        assert_eq!(
            service.admit_add(&add_request(entry.clone(), 4)),
            Err(RejectReason::StaleSequence)
        );
        // Higher sequence refreshes the existing entry
        assert_eq!(service.admit_add(&add_request(entry, 6)), Ok(false));
    }

    #[test]
    fn test_remove_tombstone_blocks_late_add() {
        let keypair = Keypair::generate();
        let service = service();
        let entry = DataEntry::Authenticated(AuthenticatedData::sign(
            sample_data(b"tombstone"),
            &keypair,
        ));
        let id = entry.id();

        assert_eq!(service.admit_add(&add_request(entry.clone(), 1)), Ok(true));
        assert_eq!(
            service.admit_remove(&remove_request(id, 2, &keypair)),
            Ok(true)
        );
        assert!(service.store().get(&id).is_none());

        // A replayed add with the old sequence must not resurrect the record
        assert_eq!(
            service.admit_add(&add_request(entry, 1)),
            Err(RejectReason::StaleSequence)
        );
    }

    #[test]
    fn test_remove_unknown_id_records_sequence() {
        let keypair = Keypair::generate();
        let service = service();
        let entry = DataEntry::Plain(sample_data(b"late"));
        let id = entry.id();

        assert_eq!(
            service.admit_remove(&remove_request(id, 3, &keypair)),
            Ok(false)
        );
        // The remembered sequence now gates adds
        assert_eq!(
            service.admit_add(&add_request(entry, 2)),
            Err(RejectReason::StaleSequence)
        );
    }

    // ==================== Authenticated data ====================

    #[test]
    fn test_first_seen_key_binds_identity() {
        let owner = Keypair::generate();
        let hijacker = Keypair::generate();
        let service = service();

        let data = sample_data(b"identity");
        let owned = DataEntry::Authenticated(AuthenticatedData::sign(data.clone(), &owner));
        let id = owned.id();
        assert_eq!(service.admit_add(&add_request(owned, 1)), Ok(true));

        // Same record (same content identity) republished under a different
        // key: identity hijack refused.
        let forged = DataEntry::Authenticated(AuthenticatedData::sign(data, &hijacker));
        assert_eq!(forged.id(), id);
        assert_eq!(
            service.admit_add(&add_request(forged, 2)),
            Err(RejectReason::SenderKeyMismatch)
        );
    }

    #[test]
    fn test_authenticated_bad_signature_rejected() {
        let keypair = Keypair::generate();
        let service = service();

        let mut auth = AuthenticatedData::sign(sample_data(b"sig"), &keypair);
        auth.signature[0] ^= 1;
        assert_eq!(
            service.admit_add(&add_request(DataEntry::Authenticated(auth), 1)),
            Err(RejectReason::InvalidSignature)
        );
    }

    #[test]
    fn test_authenticated_remove_requires_owner_key() {
        let owner = Keypair::generate();
        let stranger = Keypair::generate();
        let service = service();

        let entry =
            DataEntry::Authenticated(AuthenticatedData::sign(sample_data(b"mine"), &owner));
        let id = entry.id();
        assert_eq!(service.admit_add(&add_request(entry, 1)), Ok(true));

        assert_eq!(
            service.admit_remove(&remove_request(id, 2, &stranger)),
            Err(RejectReason::SenderKeyMismatch)
        );
        assert_eq!(
            service.admit_remove(&remove_request(id, 2, &owner)),
            Ok(true)
        );
    }

    // ==================== Authorized data ====================

    #[test]
    fn test_authorization_gate() {
        let permitted = Keypair::generate();
        let outsider = Keypair::generate();
        let service = service_with_keys(StaticAuthorizedKeys::new([permitted.key_hash()]));

        let data = sample_data(b"privileged");

        // Valid signature from a key outside the set: rejected
        let outsider_entry = DataEntry::Authorized(AuthorizedData::sign(data.clone(), &outsider));
        assert_eq!(
            service.admit_add(&add_request(outsider_entry, 1)),
            Err(RejectReason::UnauthorizedKey)
        );

        // Same payload signed by the permitted key: accepted
        let permitted_entry = DataEntry::Authorized(AuthorizedData::sign(data, &permitted));
        assert_eq!(service.admit_add(&add_request(permitted_entry, 1)), Ok(true));
    }

    #[test]
    fn test_authorized_tampered_payload_rejected() {
        let permitted = Keypair::generate();
        let service = service_with_keys(StaticAuthorizedKeys::new([permitted.key_hash()]));

        let mut auth = AuthorizedData::sign(sample_data(b"privileged"), &permitted);
        auth.data.payload[0] ^= 1;
        assert_eq!(
            service.admit_add(&add_request(DataEntry::Authorized(auth), 1)),
            Err(RejectReason::InvalidSignature)
        );
    }

    // ==================== Plain removal ====================

    #[test]
    fn test_plain_records_are_append_only() {
        let keypair = Keypair::generate();
        let service = service();
        let entry = DataEntry::Plain(sample_data(b"append-only"));
        let id = entry.id();

        assert_eq!(service.admit_add(&add_request(entry, 1)), Ok(true));
        assert_eq!(
            service.admit_remove(&remove_request(id, 2, &keypair)),
            Err(RejectReason::RemovalNotAllowed)
        );
        assert!(service.store().get(&id).is_some());
    }
}

//! Ban list: addresses excluded from all connection attempts.
//!
//! The ban list is an explicit owned structure handed to every component
//! that needs it (node, peer group, validator) rather than a process-wide
//! singleton, so several nodes can coexist in one process under test.
//!
//! Entries never expire here; expiry policy belongs to an outer layer.

use crate::Address;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;
use tracing::info;

/// Why an address was banned.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BanReason {
    /// The address-validation handshake failed or timed out
    AddressValidationFailed,
    /// Authorized-data signature verification failed repeatedly
    InvalidSignature,
    /// Any other protocol violation (bad hello, malformed frames, ...)
    ProtocolViolation,
}

/// A single ban record.
#[derive(Debug, Clone)]
pub struct BanEntry {
    pub address: Address,
    pub reason: BanReason,
    pub banned_at: SystemTime,
}

/// Process-visible record of banned addresses.
///
/// Thread-safe; wrap in `Arc` for shared ownership. Mutations are
/// serialized by the inner lock, reads are snapshots.
pub struct BanList {
    entries: RwLock<HashMap<Address, BanEntry>>,
}

impl Default for BanList {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban an address. Returns false if it was already banned (the original
    /// entry, including its reason, is kept).
    pub fn ban(&self, address: Address, reason: BanReason) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&address) {
            return false;
        }
        info!("Banning {} ({:?})", address, reason);
        entries.insert(
            address.clone(),
            BanEntry {
                address,
                reason,
                banned_at: SystemTime::now(),
            },
        );
        true
    }

    pub fn is_banned(&self, address: &Address) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(address)
    }

    /// Look up the ban record for an address.
    pub fn get(&self, address: &Address) -> Option<BanEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }

    /// Snapshot of all ban records.
    pub fn entries(&self) -> Vec<BanEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

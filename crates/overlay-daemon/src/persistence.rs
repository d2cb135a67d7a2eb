//! Persistence for known peers.
//!
//! Stores discovered peer addresses to disk so a restarted daemon can
//! bootstrap from more than its seed list. Peers live in
//! `known_peers.json` within the data directory.

use anyhow::Result;
use overlay_core::Address;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted peer information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedPeer {
    /// Address for reconnecting ("host:port")
    pub address: String,
    /// Last time we saw this peer (unix timestamp ms)
    pub last_seen: u64,
}

/// Collection of persisted peers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedPeers {
    pub peers: Vec<PersistedPeer>,
}

impl PersistedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a peer.
    pub fn upsert(&mut self, address: &Address, last_seen: u64) {
        let key = address.to_string();
        if let Some(existing) = self.peers.iter_mut().find(|p| p.address == key) {
            existing.last_seen = last_seen;
        } else {
            self.peers.push(PersistedPeer {
                address: key,
                last_seen,
            });
        }
    }

    /// Remove a peer by address.
    pub fn remove(&mut self, address: &Address) {
        let key = address.to_string();
        self.peers.retain(|p| p.address != key);
    }

    /// All addresses that still parse (entries from older formats are
    /// skipped silently).
    pub fn addresses(&self) -> Vec<Address> {
        self.peers
            .iter()
            .filter_map(|p| p.address.parse().ok())
            .collect()
    }
}

/// Storage for persisted peers.
pub struct PeerStorage {
    path: PathBuf,
    peers: PersistedPeers,
}

impl PeerStorage {
    /// Create storage under the given data directory, loading any
    /// existing `known_peers.json`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join("known_peers.json");

        let peers = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => PersistedPeers::new(),
        };
        Ok(Self { path, peers })
    }

    pub fn peers(&self) -> &PersistedPeers {
        &self.peers
    }

    /// Record a peer sighting and write through to disk.
    pub fn record(&mut self, address: &Address, now_ms: u64) -> Result<()> {
        self.peers.upsert(address, now_ms);
        self.save()
    }

    /// Drop a peer (e.g. after it was banned) and write through.
    pub fn forget(&mut self, address: &Address) -> Result<()> {
        self.peers.remove(address);
        self.save()
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.peers)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_addresses() {
        let mut peers = PersistedPeers::new();
        let address = Address::localhost(8333);

        peers.upsert(&address, 1000);
        peers.upsert(&address, 2000);
        assert_eq!(peers.peers.len(), 1);
        assert_eq!(peers.peers[0].last_seen, 2000);
        assert_eq!(peers.addresses(), vec![address]);
    }

    #[test]
    fn test_remove() {
        let mut peers = PersistedPeers::new();
        let address = Address::localhost(8333);
        peers.upsert(&address, 1000);
        peers.remove(&address);
        assert!(peers.peers.is_empty());
    }

    #[test]
    fn test_unparseable_addresses_skipped() {
        let peers = PersistedPeers {
            peers: vec![PersistedPeer {
                address: "not-an-address".into(),
                last_seen: 0,
            }],
        };
        assert!(peers.addresses().is_empty());
    }

    #[test]
    fn test_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::localhost(9000);

        {
            let mut storage = PeerStorage::new(dir.path()).unwrap();
            storage.record(&address, 1234).unwrap();
        }

        let storage = PeerStorage::new(dir.path()).unwrap();
        assert_eq!(storage.peers().addresses(), vec![address]);
        assert_eq!(storage.peers().peers[0].last_seen, 1234);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("known_peers.json"), b"{garbage").unwrap();

        let storage = PeerStorage::new(dir.path()).unwrap();
        assert!(storage.peers().peers.is_empty());
    }

    #[test]
    fn test_forget() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::localhost(9001);

        let mut storage = PeerStorage::new(dir.path()).unwrap();
        storage.record(&address, 1).unwrap();
        storage.forget(&address).unwrap();

        let reloaded = PeerStorage::new(dir.path()).unwrap();
        assert!(reloaded.peers().peers.is_empty());
    }
}

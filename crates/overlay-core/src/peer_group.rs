//! Peer group: the node's current view of known and connected peers.
//!
//! Known addresses are partitioned into the configured seed (bootstrap)
//! set and peers discovered through exchange gossip. The store is mutated
//! only by the peer exchange service and connection lifecycle events; all
//! mutations are serialized by the inner locks.
//!
//! Invariant: an address present in the ban list never enters the
//! connected set, and banned addresses are filtered out of every merge and
//! sample.

use crate::Address;
use crate::ban::BanList;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::debug;

/// A peer learned through exchange gossip.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub address: Address,
    /// When this peer was first reported to us
    pub first_seen: SystemTime,
    /// When this peer was last reported or connected
    pub last_seen: SystemTime,
}

/// Shared store of known peer addresses and open connections.
pub struct PeerGroupStore {
    seeds: Vec<Address>,
    ban_list: Arc<BanList>,
    discovered: RwLock<HashMap<Address, DiscoveredPeer>>,
    connected: RwLock<HashSet<Address>>,
}

impl PeerGroupStore {
    pub fn new(seeds: Vec<Address>, ban_list: Arc<BanList>) -> Self {
        Self {
            seeds,
            ban_list,
            discovered: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashSet::new()),
        }
    }

    pub fn seeds(&self) -> &[Address] {
        &self.seeds
    }

    pub fn is_seed(&self, address: &Address) -> bool {
        self.seeds.contains(address)
    }

    /// Merge a reported peer list, deduplicated by address and excluding
    /// banned addresses and ourselves. Returns how many peers were new.
    pub fn merge_reported(&self, peers: &[Address], own_address: Option<&Address>) -> usize {
        let now = SystemTime::now();
        let mut discovered = self.discovered.write().unwrap_or_else(|e| e.into_inner());
        let mut added = 0;
        for address in peers {
            if Some(address) == own_address {
                continue;
            }
            if self.ban_list.is_banned(address) {
                debug!("Ignoring banned peer {} in exchange", address);
                continue;
            }
            match discovered.get_mut(address) {
                Some(peer) => {
                    peer.last_seen = now;
                }
                None => {
                    discovered.insert(
                        address.clone(),
                        DiscoveredPeer {
                            address: address.clone(),
                            first_seen: now,
                            last_seen: now,
                        },
                    );
                    added += 1;
                }
            }
        }
        added
    }

    pub fn remove_discovered(&self, address: &Address) {
        self.discovered
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }

    /// All discovered (non-seed) peers, banned addresses excluded.
    pub fn discovered_snapshot(&self) -> Vec<Address> {
        self.discovered
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|address| !self.ban_list.is_banned(address))
            .cloned()
            .collect()
    }

    /// All known peers: seeds plus discovered, banned addresses excluded.
    pub fn known_peers(&self) -> Vec<Address> {
        let mut peers: Vec<Address> = self
            .seeds
            .iter()
            .filter(|address| !self.ban_list.is_banned(address))
            .cloned()
            .collect();
        for address in self.discovered_snapshot() {
            if !peers.contains(&address) {
                peers.push(address);
            }
        }
        peers
    }

    /// A shuffled subset of known peers to report in an exchange message.
    pub fn exchange_sample(&self, limit: usize, exclude: Option<&Address>) -> Vec<Address> {
        use rand::seq::SliceRandom;
        let mut peers = self.known_peers();
        peers.retain(|address| Some(address) != exclude);
        peers.shuffle(&mut rand::rng());
        peers.truncate(limit);
        peers
    }

    /// Record an open connection. Refuses banned addresses, upholding the
    /// "banned implies never connected" invariant.
    pub fn mark_connected(&self, address: Address) -> bool {
        if self.ban_list.is_banned(&address) {
            debug!("Refusing to mark banned address {} connected", address);
            return false;
        }
        self.connected
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address)
    }

    pub fn mark_disconnected(&self, address: &Address) {
        self.connected
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }

    pub fn is_connected(&self, address: &Address) -> bool {
        self.connected
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(address)
    }

    pub fn connected_snapshot(&self) -> Vec<Address> {
        self.connected
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connected
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn known_count(&self) -> usize {
        self.known_peers().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban::BanReason;

    fn store_with_seeds(seeds: Vec<Address>) -> (PeerGroupStore, Arc<BanList>) {
        let ban_list = Arc::new(BanList::new());
        let store = PeerGroupStore::new(seeds, Arc::clone(&ban_list));
        (store, ban_list)
    }

    #[test]
    fn test_merge_deduplicates() {
        let (store, _) = store_with_seeds(vec![]);
        let a = Address::localhost(1);
        let b = Address::localhost(2);

        assert_eq!(store.merge_reported(&[a.clone(), b.clone()], None), 2);
        assert_eq!(store.merge_reported(&[a.clone(), b.clone()], None), 0);
        assert_eq!(store.discovered_snapshot().len(), 2);
    }

    #[test]
    fn test_merge_excludes_banned() {
        let (store, ban_list) = store_with_seeds(vec![]);
        let bad = Address::localhost(666);
        ban_list.ban(bad.clone(), BanReason::AddressValidationFailed);

        assert_eq!(store.merge_reported(&[bad.clone()], None), 0);
        assert!(store.discovered_snapshot().is_empty());
    }

    #[test]
    fn test_merge_excludes_own_address() {
        let (store, _) = store_with_seeds(vec![]);
        let me = Address::localhost(1);
        assert_eq!(store.merge_reported(&[me.clone()], Some(&me)), 0);
    }

    #[test]
    fn test_banned_after_merge_leaves_snapshots() {
        let (store, ban_list) = store_with_seeds(vec![]);
        let peer = Address::localhost(5);
        store.merge_reported(&[peer.clone()], None);
        assert_eq!(store.discovered_snapshot().len(), 1);

        ban_list.ban(peer, BanReason::ProtocolViolation);
        assert!(store.discovered_snapshot().is_empty());
        assert!(store.known_peers().is_empty());
    }

    #[test]
    fn test_known_peers_includes_seeds() {
        let seed = Address::localhost(100);
        let (store, _) = store_with_seeds(vec![seed.clone()]);
        let peer = Address::localhost(1);
        store.merge_reported(&[peer.clone()], None);

        let known = store.known_peers();
        assert!(known.contains(&seed));
        assert!(known.contains(&peer));
        assert!(store.is_seed(&seed));
        assert!(!store.is_seed(&peer));
    }

    #[test]
    fn test_banned_address_never_connected() {
        let (store, ban_list) = store_with_seeds(vec![]);
        let bad = Address::localhost(7);
        ban_list.ban(bad.clone(), BanReason::AddressValidationFailed);

        assert!(!store.mark_connected(bad.clone()));
        assert!(!store.is_connected(&bad));
        assert_eq!(store.connected_count(), 0);
    }

    #[test]
    fn test_connect_disconnect_cycle() {
        let (store, _) = store_with_seeds(vec![]);
        let peer = Address::localhost(9);

        assert!(store.mark_connected(peer.clone()));
        assert!(store.is_connected(&peer));

        store.mark_disconnected(&peer);
        assert!(!store.is_connected(&peer));
    }

    #[test]
    fn test_exchange_sample_respects_limit_and_exclusion() {
        let (store, _) = store_with_seeds(vec![]);
        let peers: Vec<Address> = (1..=10).map(Address::localhost).collect();
        store.merge_reported(&peers, None);

        let sample = store.exchange_sample(4, Some(&peers[0]));
        assert_eq!(sample.len(), 4);
        assert!(!sample.contains(&peers[0]));
    }

    #[test]
    fn test_exchange_sample_smaller_than_limit() {
        let (store, _) = store_with_seeds(vec![]);
        store.merge_reported(&[Address::localhost(1)], None);
        assert_eq!(store.exchange_sample(50, None).len(), 1);
    }
}

//! Node configuration.
//!
//! Everything tunable is supplied at construction: seed addresses, peer
//! targets, timeouts, fanout defaults, and the frame-size ceiling.

use crate::Address;
use crate::framing::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;

/// Configuration surface of one overlay node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to listen on. Port 0 lets the transport pick one.
    pub listen_address: Address,
    /// Bootstrap seed addresses.
    pub seed_addresses: Vec<Address>,
    /// How many connected peers the node aims for.
    pub target_peer_count: usize,
    /// Default fraction of connected peers targeted per gossip round.
    pub default_distribution_factor: f64,
    /// Deadline for one address-validation handshake.
    pub validation_timeout: Duration,
    /// Deadline for one broadcast round.
    pub broadcast_timeout: Duration,
    /// Delay before a resilience rebroadcast.
    pub rebroadcast_delay: Duration,
    /// How many successful exchanges the initial bootstrap waits for.
    pub exchange_quorum: usize,
    /// Outer deadline for a whole peer-exchange round.
    pub exchange_timeout: Duration,
    /// Deadline for a single exchange request/response.
    pub exchange_reply_timeout: Duration,
    /// Upper bound on peers dialed in one exchange round.
    pub max_exchange_peers: usize,
    /// Upper bound on addresses reported in one exchange message.
    pub max_peers_in_exchange: usize,
    /// Deadline for dialing a peer.
    pub dial_timeout: Duration,
    /// Deadline for an unanswered keep-alive probe.
    pub keep_alive_timeout: Duration,
    /// Ceiling for a single wire frame.
    pub max_frame_bytes: usize,
}

impl NodeConfig {
    /// A configuration with production-shaped defaults for everything but
    /// the listen address and seeds.
    pub fn new(listen_address: Address, seed_addresses: Vec<Address>) -> Self {
        Self {
            listen_address,
            seed_addresses,
            target_peer_count: 8,
            default_distribution_factor: 0.75,
            validation_timeout: Duration::from_secs(10),
            broadcast_timeout: Duration::from_secs(90),
            rebroadcast_delay: Duration::from_millis(500),
            exchange_quorum: 2,
            exchange_timeout: Duration::from_secs(30),
            exchange_reply_timeout: Duration::from_secs(10),
            max_exchange_peers: 10,
            max_peers_in_exchange: 50,
            dial_timeout: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(30),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = NodeConfig::new(Address::localhost(0), vec![Address::localhost(1)]);
        assert_eq!(config.seed_addresses.len(), 1);
        assert!(config.target_peer_count > 0);
        assert!(config.default_distribution_factor > 0.0);
        assert!(config.default_distribution_factor <= 1.0);
        assert!(config.exchange_quorum >= 1);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }
}

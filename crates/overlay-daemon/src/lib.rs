//! overlay-daemon: headless overlay node.
//!
//! Wires overlay-core to plain TCP, persists discovered peers, and runs
//! the bootstrap exchange plus keep-alive rounds.

pub mod persistence;

pub use persistence::{PeerStorage, PersistedPeer, PersistedPeers};

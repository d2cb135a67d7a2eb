//! overlay-core: peer-to-peer overlay network substrate.
//!
//! This crate provides the trust and framing layer that lets independent,
//! mutually-untrusting nodes exchange structured messages, discover each
//! other, and propagate signed data records without a central coordinator:
//! - length-prefixed envelope framing over any byte-stream transport
//! - connections with serialized writes and listener dispatch
//! - the address-validation anti-spoofing handshake and the ban list
//! - peer-exchange gossip for bootstrap and discovery
//! - broadcast fan-out with configurable distribution factor
//! - the authenticated/authorized distributed-data admission model

pub mod address;
pub mod ban;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod data;
pub mod envelope;
pub mod exchange;
pub mod framing;
pub mod keepalive;
pub mod listeners;
pub mod node;
pub mod peer_group;
pub mod transport;
pub mod validation;

pub use address::{Address, AddressError};
pub use ban::{BanEntry, BanList, BanReason};
pub use broadcast::{BroadcastError, BroadcastResult, Broadcaster};
pub use config::NodeConfig;
pub use connection::{CloseReason, Connection, ConnectionDirection, ConnectionEvent};
pub use crypto::{KeyHash, Keypair};
pub use data::{
    AddDataRequest, AdmissionService, AuthenticatedData, AuthorizedData, AuthorizedKeys,
    DataEntry, DataGossipService, DataId, DataStore, DataTag, DecodeError, DecoderRegistry,
    DistributedData, InMemoryDataStore, MetaData, RejectReason, RemoveDataRequest,
    StaticAuthorizedKeys,
};
pub use envelope::{Envelope, PROTOCOL_VERSION, WireMessage};
pub use exchange::{ExchangeError, ExchangeSummary, PeerExchangeService};
pub use framing::{EnvelopeCodec, FramingError};
pub use keepalive::KeepAliveService;
pub use listeners::{Listeners, Subscription};
pub use node::{Node, NodeError, NodeEvent};
pub use peer_group::{DiscoveredPeer, PeerGroupStore};
pub use transport::{BoxedSocket, MemoryTransport, TcpTransport, Transport};
pub use validation::{AddressValidator, ValidationError, ValidationOutcome, ValidationState};

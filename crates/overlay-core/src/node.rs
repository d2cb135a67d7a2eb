//! The node: transport server, connection registry, and dispatch.
//!
//! Responsibilities:
//! - listens for inbound sockets and dials outbound ones
//! - sends/expects a hello as the first envelope of every connection
//! - reuses an existing outbound connection instead of racing a second
//!   socket to the same address
//! - answers protocol-internal messages (ping, validate-address, peer
//!   requests) and forwards everything else to node listeners
//! - unwraps broadcast envelopes and redispatches the inner message to
//!   listeners exactly once per arrival

use crate::Address;
use crate::ban::BanList;
use crate::config::NodeConfig;
use crate::connection::{
    CloseReason, Connection, ConnectionDirection, ConnectionEvent,
};
use crate::envelope::{CloseAnnouncement, WireMessage};
use crate::listeners::{Listeners, Subscription};
use crate::peer_group::PeerGroupStore;
use crate::transport::Transport;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Event emitted to node listeners.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A connection finished its hello and is usable.
    ConnectionOpened(Arc<Connection>),
    /// A connection closed.
    ConnectionClosed {
        connection: Arc<Connection>,
        reason: CloseReason,
    },
    /// A protocol message for the layers above the node.
    Message {
        connection: Arc<Connection>,
        message: WireMessage,
    },
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Address {0} is banned")]
    Banned(Address),
    #[error("Node is not started")]
    NotStarted,
    #[error("Node is already started")]
    AlreadyStarted,
    #[error("Node is stopped")]
    Stopped,
    #[error("Listen failed: {0}")]
    Listen(String),
    #[error("Dial to {address} failed: {detail}")]
    DialFailed { address: Address, detail: String },
    #[error("Dial to {0} timed out")]
    DialTimeout(Address),
    #[error(transparent)]
    Connection(#[from] crate::connection::ConnectionError),
}

type ConnectionEvents = mpsc::UnboundedSender<(String, ConnectionEvent)>;

/// One overlay node: a transport server plus its connections.
pub struct Node {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    ban_list: Arc<BanList>,
    peer_group: Arc<PeerGroupStore>,
    listeners: Arc<Listeners<NodeEvent>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    outbound_by_address: RwLock<HashMap<Address, Arc<Connection>>>,
    inbound_by_address: RwLock<HashMap<Address, String>>,
    /// Transient connections (address validation) excluded from reuse and
    /// from the connected peer group.
    transient: RwLock<HashSet<String>>,
    subscriptions: Mutex<HashMap<String, Subscription<ConnectionEvent>>>,
    my_address: OnceLock<Address>,
    events_tx: ConnectionEvents,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, ConnectionEvent)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        ban_list: Arc<BanList>,
        peer_group: Arc<PeerGroupStore>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            transport,
            ban_list,
            peer_group,
            listeners: Arc::new(Listeners::new()),
            connections: RwLock::new(HashMap::new()),
            outbound_by_address: RwLock::new(HashMap::new()),
            inbound_by_address: RwLock::new(HashMap::new()),
            transient: RwLock::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
            my_address: OnceLock::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ban_list(&self) -> &Arc<BanList> {
        &self.ban_list
    }

    pub fn peer_group(&self) -> &Arc<PeerGroupStore> {
        &self.peer_group
    }

    pub fn listeners(&self) -> &Arc<Listeners<NodeEvent>> {
        &self.listeners
    }

    /// Our own listening address, once the server is up.
    pub fn my_address(&self) -> Option<Address> {
        self.my_address.get().cloned()
    }

    /// Bind the listener and start the accept and dispatch loops.
    ///
    /// Returns the effective listen address.
    pub async fn start(self: &Arc<Self>) -> Result<Address, NodeError> {
        let (address, mut listener) = self
            .transport
            .listen(&self.config.listen_address)
            .await
            .map_err(|e| NodeError::Listen(e.to_string()))?;
        let _ = self.my_address.set(address.clone());
        info!("Node listening at {}", address);

        let accept_node = Arc::clone(self);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(socket) => {
                        accept_node.on_inbound_socket(socket).await;
                    }
                    Err(e) => {
                        if !accept_node.is_stopped() {
                            warn!("Accept failed: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        let mut events_rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(NodeError::AlreadyStarted)?;
        let event_node = Arc::clone(self);
        let event_task = tokio::spawn(async move {
            while let Some((connection_id, event)) = events_rx.recv().await {
                event_node.handle_connection_event(&connection_id, event).await;
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(accept_task);
        tasks.push(event_task);
        Ok(address)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn on_inbound_socket(self: &Arc<Self>, socket: crate::transport::BoxedSocket) {
        if self.is_stopped() {
            return;
        }
        let connection = self.register(socket, ConnectionDirection::Inbound, false);
        debug!("Accepted inbound connection {}", connection.id());
        let hello = WireMessage::Hello {
            address: self.my_address(),
        };
        if connection.send(hello).await.is_err() {
            debug!("Hello to inbound {} failed", connection.id());
        }
    }

    /// Wrap a socket in a connection wired into the node's dispatch.
    fn register(
        self: &Arc<Self>,
        socket: crate::transport::BoxedSocket,
        direction: ConnectionDirection,
        transient: bool,
    ) -> Arc<Connection> {
        let connection = Connection::open(socket, direction, self.config.max_frame_bytes);
        let id = connection.id().to_string();

        let events_tx = self.events_tx.clone();
        let forward_id = id.clone();
        let subscription = connection.listeners().subscribe(move |event| {
            let _ = events_tx.send((forward_id.clone(), event));
        });
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), subscription);
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), Arc::clone(&connection));
        if transient {
            self.transient
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id);
        }

        connection.start();
        connection
    }

    /// Get or create an outbound connection to a peer.
    ///
    /// An existing live outbound connection is reused; banned addresses
    /// are refused outright.
    pub async fn connect(self: &Arc<Self>, address: &Address) -> Result<Arc<Connection>, NodeError> {
        if self.is_stopped() {
            return Err(NodeError::Stopped);
        }
        if self.ban_list.is_banned(address) {
            return Err(NodeError::Banned(address.clone()));
        }
        if let Some(existing) = self.outbound_connection(address) {
            return Ok(existing);
        }

        let socket = self.dial(address).await?;

        // The dial took time; someone may have won the race meanwhile.
        if let Some(existing) = self.outbound_connection(address) {
            debug!("Dropping freshly dialed socket to {}: connection exists", address);
            return Ok(existing);
        }

        let connection = self.register(socket, ConnectionDirection::Outbound, false);
        connection.set_peer_address(address.clone());
        connection.mark_verified();
        self.outbound_by_address
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.clone(), Arc::clone(&connection));
        self.peer_group.mark_connected(address.clone());

        connection
            .send(WireMessage::Hello {
                address: self.my_address(),
            })
            .await?;

        debug!("Opened outbound connection to {}", address);
        self.listeners
            .emit(NodeEvent::ConnectionOpened(Arc::clone(&connection)));
        Ok(connection)
    }

    /// Open a fresh, transient outbound connection for address validation.
    ///
    /// Never reuses an existing connection and never enters the peer
    /// group: the whole point is an independent reachability check.
    pub async fn open_validation_connection(
        self: &Arc<Self>,
        address: &Address,
    ) -> Result<Arc<Connection>, NodeError> {
        if self.is_stopped() {
            return Err(NodeError::Stopped);
        }
        if self.ban_list.is_banned(address) {
            return Err(NodeError::Banned(address.clone()));
        }
        let socket = self.dial(address).await?;
        let connection = self.register(socket, ConnectionDirection::Outbound, true);
        connection.set_peer_address(address.clone());
        connection
            .send(WireMessage::Hello {
                address: self.my_address(),
            })
            .await?;
        Ok(connection)
    }

    async fn dial(&self, address: &Address) -> Result<crate::transport::BoxedSocket, NodeError> {
        match tokio::time::timeout(self.config.dial_timeout, self.transport.dial(address)).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(e)) => Err(NodeError::DialFailed {
                address: address.clone(),
                detail: e.to_string(),
            }),
            Err(_) => Err(NodeError::DialTimeout(address.clone())),
        }
    }

    /// Send a message to a peer, connecting first if necessary.
    pub async fn send_to(
        self: &Arc<Self>,
        address: &Address,
        message: WireMessage,
    ) -> Result<Arc<Connection>, NodeError> {
        let connection = match self.connection_to(address) {
            Some(connection) => connection,
            None => self.connect(address).await?,
        };
        connection.send(message).await?;
        Ok(connection)
    }

    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn outbound_connection(&self, address: &Address) -> Option<Arc<Connection>> {
        self.outbound_by_address
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    /// Any live connection associated with the address, outbound preferred.
    pub fn connection_to(&self, address: &Address) -> Option<Arc<Connection>> {
        if let Some(connection) = self.outbound_connection(address) {
            return Some(connection);
        }
        let id = self
            .inbound_by_address
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()?;
        self.connection(&id).filter(|connection| !connection.is_closed())
    }

    /// Snapshot of peer-addressed, non-transient live connections: the
    /// population broadcasts and keep-alive rounds draw from.
    pub fn connections_snapshot(&self) -> Vec<Arc<Connection>> {
        let transient = self.transient.read().unwrap_or_else(|e| e.into_inner());
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|connection| !connection.is_closed())
            .filter(|connection| connection.peer_address().is_some())
            .filter(|connection| !transient.contains(connection.id()))
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections_snapshot().len()
    }

    async fn handle_connection_event(self: &Arc<Self>, connection_id: &str, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Envelope(envelope) => {
                let Some(connection) = self.connection(connection_id) else {
                    return;
                };
                self.handle_message(connection, envelope.payload).await;
            }
            ConnectionEvent::Closed(reason) => {
                self.on_connection_closed(connection_id, reason);
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, connection: Arc<Connection>, message: WireMessage) {
        if self.is_stopped() {
            return;
        }
        match message {
            WireMessage::Hello { address } => {
                self.on_hello(connection, address);
            }
            WireMessage::Ping { nonce } => {
                let _ = connection.send(WireMessage::Pong { nonce }).await;
            }
            WireMessage::Close { reason } => {
                debug!(
                    "Peer announced close of {} ({:?})",
                    connection.id(),
                    reason
                );
                connection.close(CloseReason::ClosedByPeer(reason));
            }
            WireMessage::ValidateAddress { nonce } => {
                match self.my_address() {
                    Some(address) => {
                        let _ = connection
                            .send(WireMessage::AddressProof { nonce, address })
                            .await;
                    }
                    None => {
                        debug!("Cannot answer address validation: server not started");
                    }
                }
            }
            WireMessage::PeersRequest { nonce, peers } => {
                let own = self.my_address();
                let added = self.peer_group.merge_reported(&peers, own.as_ref());
                if added > 0 {
                    debug!("Exchange request brought {} new peers", added);
                }
                let sample = self.peer_group.exchange_sample(
                    self.config.max_peers_in_exchange,
                    connection.peer_address().as_ref(),
                );
                let _ = connection
                    .send(WireMessage::PeersResponse {
                        nonce,
                        peers: sample,
                    })
                    .await;
            }
            WireMessage::Broadcast { message } => {
                // Unwrap and redispatch once; dedup belongs to admission
                self.listeners.emit(NodeEvent::Message {
                    connection,
                    message: *message,
                });
            }
            other => {
                self.listeners.emit(NodeEvent::Message {
                    connection,
                    message: other,
                });
            }
        }
    }

    fn on_hello(self: &Arc<Self>, connection: Arc<Connection>, claimed: Option<Address>) {
        match connection.direction() {
            ConnectionDirection::Outbound => {
                // We dialed this address; the peer must announce the same one
                let expected = connection.peer_address();
                if claimed != expected {
                    warn!(
                        "Peer at {} claims to be {}; closing",
                        expected.map(|a| a.to_string()).unwrap_or_default(),
                        claimed.map(|a| a.to_string()).unwrap_or_default(),
                    );
                    connection.close(CloseReason::ProtocolError(
                        "hello address does not match dialed address".into(),
                    ));
                }
            }
            ConnectionDirection::Inbound => {
                let Some(address) = claimed else {
                    // Non-listening peer; usable but never advertised
                    self.listeners
                        .emit(NodeEvent::ConnectionOpened(connection));
                    return;
                };
                if self.ban_list.is_banned(&address) {
                    info!("Closing inbound connection from banned {}", address);
                    connection.close(CloseReason::Banned);
                    return;
                }
                connection.set_peer_address(address.clone());
                {
                    // First connection from an address owns the index entry;
                    // later ones (e.g. transient validation dials) stay
                    // reachable through their own handle only.
                    let mut inbound = self
                        .inbound_by_address
                        .write()
                        .unwrap_or_else(|e| e.into_inner());
                    let taken = inbound
                        .get(&address)
                        .and_then(|id| self.connection(id))
                        .is_some_and(|existing| {
                            !existing.is_closed() && existing.id() != connection.id()
                        });
                    if !taken {
                        inbound.insert(address.clone(), connection.id().to_string());
                    }
                }
                let transient = self
                    .transient
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains(connection.id());
                if !transient {
                    self.peer_group.mark_connected(address);
                }
                self.listeners
                    .emit(NodeEvent::ConnectionOpened(connection));
            }
        }
    }

    fn on_connection_closed(self: &Arc<Self>, connection_id: &str, reason: CloseReason) {
        let connection = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.remove(connection_id)
        };
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id);
        self.transient
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id);

        let Some(connection) = connection else {
            return;
        };
        if let Some(address) = connection.peer_address() {
            {
                let mut outbound = self
                    .outbound_by_address
                    .write()
                    .unwrap_or_else(|e| e.into_inner());
                if outbound
                    .get(&address)
                    .is_some_and(|existing| existing.id() == connection_id)
                {
                    outbound.remove(&address);
                }
            }
            {
                let mut inbound = self
                    .inbound_by_address
                    .write()
                    .unwrap_or_else(|e| e.into_inner());
                if inbound.get(&address).is_some_and(|id| id == connection_id) {
                    inbound.remove(&address);
                }
            }
            // Only drop from the connected set when no path remains
            if self.connection_to(&address).is_none() {
                self.peer_group.mark_disconnected(&address);
            }
        }
        debug!("Connection {} closed ({:?})", connection_id, reason);
        self.listeners.emit(NodeEvent::ConnectionClosed {
            connection,
            reason,
        });
    }

    /// Close every connection (announcing the shutdown) and stop the loops.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "Node {} shutting down",
            self.my_address()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "(unstarted)".into())
        );

        let connections: Vec<Arc<Connection>> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut closers = Vec::new();
        for connection in connections {
            closers.push(tokio::spawn(async move {
                connection
                    .close_gracefully(CloseAnnouncement::Shutdown)
                    .await;
            }));
        }
        for closer in closers {
            let _ = closer.await;
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.outbound_by_address
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inbound_by_address
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.my_address())
            .field("connections", &self.connection_count())
            .finish()
    }
}

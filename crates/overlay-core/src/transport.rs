//! Transport abstraction for peer-to-peer networking.
//!
//! The overlay core is transport-agnostic: anything that can dial and
//! listen for bidirectional byte streams works (plain TCP, Tor or I2P
//! hidden services, in-process pipes).
//!
//! Implementations:
//! - [`TcpTransport`]: plain TCP sockets (the daemon's default)
//! - [`MemoryTransport`]: in-process duplex pipes for tests and
//!   multi-node simulation

use crate::Address;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A bidirectional byte stream to one peer.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Socket for T {}

pub type BoxedSocket = Box<dyn Socket>;

/// Transport layer: dials peers and accepts inbound streams.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open an outbound stream to a peer.
    async fn dial(&self, address: &Address) -> io::Result<BoxedSocket>;

    /// Start listening at the given address.
    ///
    /// Returns the effective local address (ports may be assigned by the
    /// OS) and the listener handle.
    async fn listen(&self, address: &Address) -> io::Result<(Address, Box<dyn TransportListener>)>;
}

/// Accepts inbound streams for one listening endpoint.
#[async_trait]
pub trait TransportListener: Send {
    async fn accept(&mut self) -> io::Result<BoxedSocket>;
}

// ============================================================================
// TCP
// ============================================================================

/// Plain TCP transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, address: &Address) -> io::Result<BoxedSocket> {
        let stream = TcpStream::connect((address.host(), address.port())).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, address: &Address) -> io::Result<(Address, Box<dyn TransportListener>)> {
        let listener = TcpListener::bind((address.host(), address.port())).await?;
        let local = listener.local_addr()?;
        let effective = Address::new(address.host(), local.port());
        Ok((effective, Box::new(TcpTransportListener { listener })))
    }
}

struct TcpTransportListener {
    listener: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&mut self) -> io::Result<BoxedSocket> {
        let (stream, _) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Buffer size of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

type PendingSockets = mpsc::UnboundedSender<DuplexStream>;

/// In-process transport: a shared hub of listening addresses connected by
/// duplex pipes.
///
/// Clones share the hub, so several nodes constructed with clones of one
/// `MemoryTransport` can reach each other, the in-process equivalent of a
/// network.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Mutex<HashMap<Address, PendingSockets>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, address: &Address) -> io::Result<BoxedSocket> {
        let acceptor = {
            let hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
            hub.get(address).cloned()
        };
        let acceptor = acceptor.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no listener at {address}"),
            )
        })?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        acceptor.send(remote).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("listener at {address} is gone"),
            )
        })?;
        Ok(Box::new(local))
    }

    async fn listen(&self, address: &Address) -> io::Result<(Address, Box<dyn TransportListener>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
            if hub.contains_key(address) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{address} already in use"),
                ));
            }
            hub.insert(address.clone(), tx);
        }
        Ok((address.clone(), Box::new(MemoryTransportListener { rx })))
    }
}

struct MemoryTransportListener {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

#[async_trait]
impl TransportListener for MemoryTransportListener {
    async fn accept(&mut self) -> io::Result<BoxedSocket> {
        match self.rx.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "listener shut down",
            )),
        }
    }
}

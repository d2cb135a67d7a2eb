//! A live connection: one socket plus its envelope codec.
//!
//! The read half is driven by a spawned task that feeds the codec and
//! dispatches completed envelopes to all registered listeners before
//! pulling more bytes, so envelopes from one connection reach listeners in
//! stream-arrival order. The write half sits behind a mutex so concurrent
//! sends serialize and partial frames never interleave.
//!
//! Closing is idempotent; listeners are notified exactly once with the
//! close reason.

use crate::Address;
use crate::envelope::{CloseAnnouncement, Envelope, WireMessage};
use crate::framing::{self, EnvelopeCodec, FramingError};
use crate::listeners::Listeners;
use crate::transport::BoxedSocket;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long a graceful close waits for the close announcement to flush.
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_millis(200);

/// Connection direction from our perspective.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// close() requested locally (shutdown, duplicate resolution, ...)
    Shutdown,
    /// The peer announced the close before disconnecting
    ClosedByPeer(CloseAnnouncement),
    /// The stream ended without an announcement
    RemoteClosed,
    /// Socket I/O fault
    Fault(String),
    /// Fatal framing violation; the stream cannot be re-aligned
    ProtocolError(String),
    /// The address-validation handshake failed
    AddressValidationFailed,
    /// The peer address turned out to be banned
    Banned,
    /// The peer stopped answering keep-alive probes
    KeepAliveTimeout,
    /// A connection to the same address already exists
    DuplicateConnection,
}

/// Event emitted by a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A complete, version-checked envelope arrived
    Envelope(Envelope),
    /// The connection closed; emitted exactly once
    Closed(CloseReason),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection is closed")]
    Closed,
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("Socket write failed: {0}")]
    Io(String),
}

/// One live socket with framing, listeners, and close semantics.
///
/// Owned by the node that created it; listeners hold only a non-owning
/// registration.
pub struct Connection {
    id: String,
    direction: ConnectionDirection,
    max_frame: usize,
    peer_address: RwLock<Option<Address>>,
    /// True once the peer address is trusted: outbound connections are
    /// verified by construction (we dialed the address), inbound ones only
    /// after address validation succeeds.
    verified: AtomicBool,
    reader: Mutex<Option<ReadHalf<BoxedSocket>>>,
    writer: Arc<AsyncMutex<WriteHalf<BoxedSocket>>>,
    listeners: Arc<Listeners<ConnectionEvent>>,
    closed: AtomicBool,
    close_reason: RwLock<Option<CloseReason>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Take ownership of a socket.
    ///
    /// The read loop does not run until [`Connection::start`] is called,
    /// so callers can register listeners first without racing the first
    /// inbound envelope.
    pub fn open(
        socket: BoxedSocket,
        direction: ConnectionDirection,
        max_frame: usize,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(socket);
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            max_frame,
            peer_address: RwLock::new(None),
            verified: AtomicBool::new(false),
            reader: Mutex::new(Some(read_half)),
            writer: Arc::new(AsyncMutex::new(write_half)),
            listeners: Arc::new(Listeners::new()),
            closed: AtomicBool::new(false),
            close_reason: RwLock::new(None),
            read_task: Mutex::new(None),
        })
    }

    /// Start driving the codec against the socket's inbound stream.
    /// Idempotent; only the first call spawns the read loop.
    pub fn start(self: &Arc<Self>) {
        let Some(read_half) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take()
        else {
            return;
        };
        let task = tokio::spawn(Self::read_loop(Arc::clone(self), read_half));
        *self.read_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    async fn read_loop(connection: Arc<Connection>, mut reader: ReadHalf<BoxedSocket>) {
        let mut codec = EnvelopeCodec::new(connection.max_frame);
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("Connection {} stream ended", connection.id);
                    connection.close(CloseReason::RemoteClosed);
                    break;
                }
                Ok(n) => {
                    if let Err(e) = codec.feed(&buf[..n]) {
                        warn!("Fatal framing error on {}: {}", connection.id, e);
                        connection.close(CloseReason::ProtocolError(e.to_string()));
                        break;
                    }
                    // Dispatch everything completed before reading again
                    while let Some(envelope) = codec.next_envelope() {
                        connection
                            .listeners
                            .emit(ConnectionEvent::Envelope(envelope));
                    }
                }
                Err(e) => {
                    debug!("Read error on {}: {}", connection.id, e);
                    connection.close(CloseReason::Fault(e.to_string()));
                    break;
                }
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// The peer's address, once known (outbound: the dialed address;
    /// inbound: the address claimed in the peer's hello).
    pub fn peer_address(&self) -> Option<Address> {
        self.peer_address
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_peer_address(&self, address: Address) {
        *self
            .peer_address
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(address);
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    pub fn mark_verified(&self) {
        self.verified.store(true, Ordering::SeqCst);
    }

    pub fn listeners(&self) -> &Arc<Listeners<ConnectionEvent>> {
        &self.listeners
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Send one message, framed, to the peer.
    ///
    /// Concurrent callers are serialized by the writer lock; a frame is
    /// always written whole. A write fault closes the connection.
    pub async fn send(&self, message: WireMessage) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let frame = framing::encode_frame(&Envelope::new(message), self.max_frame)?;
        let result = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            self.close(CloseReason::Fault(e.to_string()));
            return Err(ConnectionError::Io(e.to_string()));
        }
        Ok(())
    }

    /// Announce the close to the peer (best effort), then close.
    pub async fn close_gracefully(&self, announcement: CloseAnnouncement) {
        let _ = tokio::time::timeout(
            GRACEFUL_CLOSE_TIMEOUT,
            self.send(WireMessage::Close {
                reason: announcement,
            }),
        )
        .await;
        self.close(CloseReason::Shutdown);
    }

    /// Close the connection. Idempotent: the first call wins, notifies
    /// listeners exactly once, and releases the socket; later calls are
    /// no-ops.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing connection {} ({:?})", self.id, reason);
        *self
            .close_reason
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());

        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        let writer = Arc::clone(&self.writer);
        tokio::spawn(async move {
            let mut writer = writer.lock().await;
            let _ = writer.shutdown().await;
        });

        self.listeners.emit(ConnectionEvent::Closed(reason));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("peer_address", &self.peer_address())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn pipe_pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = Connection::open(
            Box::new(a),
            ConnectionDirection::Outbound,
            framing::DEFAULT_MAX_FRAME_BYTES,
        );
        let right = Connection::open(
            Box::new(b),
            ConnectionDirection::Inbound,
            framing::DEFAULT_MAX_FRAME_BYTES,
        );
        left.start();
        right.start();
        (left, right)
    }

    fn collect_events(connection: &Arc<Connection>) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(connection.listeners().subscribe(move |event| {
            let _ = tx.send(event);
        }));
        rx
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (left, right) = pipe_pair();
        let mut events = collect_events(&right);

        left.send(WireMessage::Ping { nonce: 7 }).await.unwrap();

        match next_event(&mut events).await {
            ConnectionEvent::Envelope(envelope) => {
                assert_eq!(envelope.payload, WireMessage::Ping { nonce: 7 });
            }
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (left, right) = pipe_pair();
        let mut events = collect_events(&right);

        for nonce in 0..20 {
            left.send(WireMessage::Ping { nonce }).await.unwrap();
        }

        for expected in 0..20 {
            match next_event(&mut events).await {
                ConnectionEvent::Envelope(envelope) => {
                    assert_eq!(envelope.payload, WireMessage::Ping { nonce: expected });
                }
                other => panic!("expected envelope, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_once() {
        let (left, _right) = pipe_pair();
        let mut events = collect_events(&left);

        left.close(CloseReason::Shutdown);
        left.close(CloseReason::KeepAliveTimeout);

        match next_event(&mut events).await {
            ConnectionEvent::Closed(reason) => assert_eq!(reason, CloseReason::Shutdown),
            other => panic!("expected close, got {other:?}"),
        }
        // The first reason sticks
        assert_eq!(left.close_reason(), Some(CloseReason::Shutdown));

        // No second close event
        assert!(
            tokio::time::timeout(Duration::from_millis(100), events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (left, _right) = pipe_pair();
        left.close(CloseReason::Shutdown);

        let result = left.send(WireMessage::Ping { nonce: 1 }).await;
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_peer_close_notifies_remote() {
        let (left, right) = pipe_pair();
        let mut events = collect_events(&right);

        left.close(CloseReason::Shutdown);

        match next_event(&mut events).await {
            // The pipe ends; the remote observes a stream end or fault
            ConnectionEvent::Closed(
                CloseReason::RemoteClosed | CloseReason::Fault(_),
            ) => {}
            other => panic!("expected close, got {other:?}"),
        }
        assert!(right.is_closed());
    }

    #[tokio::test]
    async fn test_peer_address_bookkeeping() {
        let (left, _right) = pipe_pair();
        assert!(left.peer_address().is_none());
        assert!(!left.is_verified());

        left.set_peer_address(Address::localhost(4000));
        left.mark_verified();
        assert_eq!(left.peer_address(), Some(Address::localhost(4000)));
        assert!(left.is_verified());
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (left, right) = pipe_pair();
        let mut events = collect_events(&right);

        let mut handles = Vec::new();
        for nonce in 0..50u64 {
            let conn = Arc::clone(&left);
            handles.push(tokio::spawn(async move {
                conn.send(WireMessage::Ping { nonce }).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // All 50 frames decode cleanly; interleaved partial writes would
        // poison the stream and surface as a protocol error instead.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            match next_event(&mut events).await {
                ConnectionEvent::Envelope(envelope) => {
                    if let WireMessage::Ping { nonce } = envelope.payload {
                        seen.insert(nonce);
                    }
                }
                other => panic!("expected envelope, got {other:?}"),
            }
        }
        assert_eq!(seen.len(), 50);
    }
}

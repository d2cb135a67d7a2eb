//! Keep-alive: ping/pong probes over idle connections.
//!
//! Each round probes every connection and closes the ones whose previous
//! probe went unanswered past the timeout. The daemon drives rounds on an
//! interval; pong routing happens through the node's event dispatch.

use crate::connection::{CloseReason, Connection};
use crate::envelope::WireMessage;
use crate::listeners::Subscription;
use crate::node::{Node, NodeEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

struct PendingPing {
    nonce: u64,
    sent_at: Instant,
    connection: Arc<Connection>,
}

/// Probes connections and reaps the silent ones.
pub struct KeepAliveService {
    node: Arc<Node>,
    /// Unanswered probes keyed by connection id.
    pending: Mutex<HashMap<String, PendingPing>>,
    subscriptions: Mutex<Vec<Subscription<NodeEvent>>>,
}

impl KeepAliveService {
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        let service = Arc::new(Self {
            node,
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&service);
        let subscription = service.node.listeners().subscribe(move |event| {
            if let Some(service) = weak.upgrade() {
                service.on_node_event(event);
            }
        });
        service
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscription);
        service
    }

    fn on_node_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::Message {
                connection,
                message: WireMessage::Pong { nonce },
            } => {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                match pending.get(connection.id()) {
                    Some(ping) if ping.nonce == nonce => {
                        pending.remove(connection.id());
                    }
                    Some(_) => {
                        debug!("Pong with stale nonce from {}", connection.id());
                    }
                    None => {}
                }
            }
            NodeEvent::ConnectionClosed { connection, .. } => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(connection.id());
            }
            _ => {}
        }
    }

    /// Number of probes still waiting for a pong.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// One keep-alive round: reap connections whose probe expired, then
    /// probe everything currently connected.
    pub async fn run_round(&self) {
        let timeout = self.node.config().keep_alive_timeout;

        let stale: Vec<Arc<Connection>> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let expired: Vec<String> = pending
                .iter()
                .filter(|(_, ping)| ping.sent_at.elapsed() >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|id| pending.remove(&id))
                .map(|ping| ping.connection)
                .collect()
        };
        for connection in stale {
            warn!(
                "Connection {} missed keep-alive; closing",
                connection.id()
            );
            connection.close(CloseReason::KeepAliveTimeout);
        }

        for connection in self.node.connections_snapshot() {
            let already_pending = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(connection.id());
            if already_pending {
                continue;
            }
            let nonce: u64 = {
                use rand::Rng;
                rand::rng().random()
            };
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(
                    connection.id().to_string(),
                    PendingPing {
                        nonce,
                        sent_at: Instant::now(),
                        connection: Arc::clone(&connection),
                    },
                );
            if connection.send(WireMessage::Ping { nonce }).await.is_err() {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(connection.id());
            }
        }
    }
}

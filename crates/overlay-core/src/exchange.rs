//! Peer exchange: the discovery gossip that bootstraps the peer group.
//!
//! On startup a node dials its seeds, swaps known-peer subsets with each,
//! and merges the results into the peer group store. Exchanges run in
//! parallel; the aggregate future completes once a configurable quorum of
//! them succeeded, and a single unreachable seed never fails the round as
//! long as one exchange path succeeds.

use crate::Address;
use crate::envelope::WireMessage;
use crate::listeners::Subscription;
use crate::node::{Node, NodeEvent};
use crate::peer_group::PeerGroupStore;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("No exchange candidates available")]
    NoCandidates,
    #[error("Every exchange attempt failed")]
    AllAttemptsFailed,
    #[error("Exchange round timed out before any success")]
    Timeout,
    #[error("Connecting to the peer failed: {0}")]
    Connect(String),
    #[error("Sending the exchange request failed")]
    Send,
    #[error("Peer did not answer the exchange in time")]
    ReplyTimeout,
    #[error("Connection closed during the exchange")]
    ConnectionClosed,
}

/// Aggregate outcome of one exchange round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeSummary {
    /// Exchanges attempted before the round settled.
    pub attempted: usize,
    /// Exchanges that completed with a response.
    pub succeeded: usize,
    /// New addresses merged into the peer group.
    pub peers_added: usize,
}

struct PendingExchange {
    nonce: u64,
    tx: oneshot::Sender<Vec<Address>>,
}

/// Drives exchange rounds against seeds and discovered peers.
pub struct PeerExchangeService {
    node: Arc<Node>,
    store: Arc<PeerGroupStore>,
    /// Outstanding requests keyed by connection id.
    pending: Mutex<HashMap<String, PendingExchange>>,
    subscriptions: Mutex<Vec<Subscription<NodeEvent>>>,
}

impl PeerExchangeService {
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        let service = Arc::new(Self {
            store: Arc::clone(node.peer_group()),
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
                message: WireMessage::PeersResponse { nonce, peers },
            } => {
                let pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(connection.id());
                match pending {
                    Some(pending) if pending.nonce == nonce => {
                        let _ = pending.tx.send(peers);
                    }
                    Some(_) => {
                        warn!(
                            "Exchange response with stale nonce on {}; dropping",
                            connection.id()
                        );
                    }
                    None => {
                        debug!("Unsolicited exchange response on {}", connection.id());
                    }
                }
            }
            NodeEvent::ConnectionClosed { connection, .. } => {
                // Dropping the sender resolves the waiting exchange with an
                // error instead of leaking a never-completing future
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(connection.id());
            }
            _ => {}
        }
    }

    /// Bootstrap exchange: dial every seed (plus already-discovered peers,
    /// up to the configured attempt bound) and merge their peer lists.
    ///
    /// Completes once the quorum of successful exchanges is reached or all
    /// attempts are exhausted. The aggregate succeeds as long as at least
    /// one exchange path succeeded.
    pub async fn initial_exchange(&self) -> Result<ExchangeSummary, ExchangeError> {
        let candidates = self.bootstrap_candidates();
        self.run_round(candidates).await
    }

    /// Opportunistic follow-up exchange against discovered peers, used to
    /// grow the group toward the target connection count.
    pub async fn further_exchange(&self) -> Result<ExchangeSummary, ExchangeError> {
        let config = self.node.config();
        let missing = config
            .target_peer_count
            .saturating_sub(self.store.connected_count());
        if missing == 0 {
            return Ok(ExchangeSummary {
                attempted: 0,
                succeeded: 0,
                peers_added: 0,
            });
        }

        use rand::seq::SliceRandom;
        let mut candidates: Vec<Address> = self
            .store
            .discovered_snapshot()
            .into_iter()
            .filter(|address| !self.store.is_connected(address))
            .collect();
        candidates.shuffle(&mut rand::rng());
        candidates.truncate(missing.min(config.max_exchange_peers));
        self.run_round(candidates).await
    }

    /// Seeds first (all of them, shuffled), then discovered peers up to the
    /// attempt bound.
    fn bootstrap_candidates(&self) -> Vec<Address> {
        use rand::seq::SliceRandom;
        let own = self.node.my_address();
        let mut rng = rand::rng();

        let mut candidates: Vec<Address> = self
            .store
            .seeds()
            .iter()
            .filter(|address| Some(*address) != own.as_ref())
            .cloned()
            .collect();
        candidates.shuffle(&mut rng);

        let mut discovered = self.store.discovered_snapshot();
        discovered.shuffle(&mut rng);
        for address in discovered {
            if candidates.len() >= self.node.config().max_exchange_peers {
                break;
            }
            if !candidates.contains(&address) && Some(&address) != own.as_ref() {
                candidates.push(address);
            }
        }
        candidates
    }

    async fn run_round(&self, candidates: Vec<Address>) -> Result<ExchangeSummary, ExchangeError> {
        if candidates.is_empty() {
            return Err(ExchangeError::NoCandidates);
        }
        let config = self.node.config();
        let quorum = config.exchange_quorum.clamp(1, candidates.len());
        debug!(
            "Exchange round against {} candidates (quorum {})",
            candidates.len(),
            quorum
        );

        let mut exchanges = FuturesUnordered::new();
        for address in candidates {
            exchanges.push(self.exchange_with(address));
        }

        let mut summary = ExchangeSummary {
            attempted: 0,
            succeeded: 0,
            peers_added: 0,
        };
        let round = async {
            while let Some(result) = exchanges.next().await {
                summary.attempted += 1;
                match result {
                    Ok(added) => {
                        summary.succeeded += 1;
                        summary.peers_added += added;
                        if summary.succeeded >= quorum {
                            break;
                        }
                    }
                    Err(e) => {
                        // One peer's failure never fails the round
                        debug!("Exchange attempt failed: {}", e);
                    }
                }
            }
        };
        let timed_out = tokio::time::timeout(config.exchange_timeout, round)
            .await
            .is_err();

        if summary.succeeded > 0 {
            info!(
                "Peer exchange settled: {}/{} succeeded, {} peers added",
                summary.succeeded, summary.attempted, summary.peers_added
            );
            Ok(summary)
        } else if timed_out {
            Err(ExchangeError::Timeout)
        } else {
            Err(ExchangeError::AllAttemptsFailed)
        }
    }

    /// One request/response exchange with a single peer. Returns how many
    /// new addresses the response contributed.
    async fn exchange_with(&self, address: Address) -> Result<usize, ExchangeError> {
        let connection = self
            .node
            .connect(&address)
            .await
            .map_err(|e| ExchangeError::Connect(e.to_string()))?;

        let nonce: u64 = {
            use rand::Rng;
            rand::rng().random()
        };
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connection.id().to_string(), PendingExchange { nonce, tx });

        let config = self.node.config();
        let own = self.node.my_address();
        let sample = self
            .store
            .exchange_sample(config.max_peers_in_exchange, Some(&address));
        if connection
            .send(WireMessage::PeersRequest {
                nonce,
                peers: sample,
            })
            .await
            .is_err()
        {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(connection.id());
            return Err(ExchangeError::Send);
        }

        match tokio::time::timeout(config.exchange_reply_timeout, rx).await {
            Err(_elapsed) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(connection.id());
                Err(ExchangeError::ReplyTimeout)
            }
            Ok(Err(_dropped)) => Err(ExchangeError::ConnectionClosed),
            Ok(Ok(peers)) => {
                let added = self.store.merge_reported(&peers, own.as_ref());
                debug!("Exchange with {} brought {} new peers", address, added);
                Ok(added)
            }
        }
    }
}

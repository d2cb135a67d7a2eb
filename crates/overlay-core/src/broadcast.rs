//! Gossip broadcast: fans a message out to a fraction of connected peers.
//!
//! `broadcast(message, factor)` targets `round(connected × factor)` peers
//! chosen by shuffle-then-take, tallies per-peer successes and faults
//! independently, and completes as soon as every targeted send settled.
//! A stalled round is forced to complete exceptionally after the
//! configured timeout.

use crate::connection::Connection;
use crate::envelope::WireMessage;
use crate::node::Node;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Immutable record of one completed broadcast round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastResult {
    pub num_success: usize,
    pub num_faults: usize,
    pub elapsed: Duration,
}

impl BroadcastResult {
    /// Total sends that settled, success or fault.
    pub fn num_attempted(&self) -> usize {
        self.num_success + self.num_faults
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Broadcast timed out with {settled}/{expected} sends settled")]
    Timeout { settled: usize, expected: usize },
}

/// How many peers a round targets: `round(connected × factor)`, bounded by
/// the connected count.
pub fn num_targets(connected: usize, factor: f64) -> usize {
    if connected == 0 || factor <= 0.0 {
        return 0;
    }
    let targets = (connected as f64 * factor).round() as usize;
    targets.min(connected)
}

/// Fans messages out across the node's connections.
pub struct Broadcaster {
    node: Arc<Node>,
}

impl Broadcaster {
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        Arc::new(Self { node })
    }

    /// Broadcast at the configured default distribution factor.
    pub async fn broadcast_default(
        &self,
        message: WireMessage,
    ) -> Result<BroadcastResult, BroadcastError> {
        let factor = self.node.config().default_distribution_factor;
        self.broadcast(message, factor).await
    }

    /// Broadcast to `round(connected × factor)` peers chosen uniformly at
    /// random without replacement. A factor of 1 targets every connected
    /// peer.
    ///
    /// One peer's send failure never aborts the others; it is tallied as a
    /// fault and the round continues.
    pub async fn broadcast(
        &self,
        message: WireMessage,
        factor: f64,
    ) -> Result<BroadcastResult, BroadcastError> {
        let started = Instant::now();
        let targets = self.select_targets(factor);
        let expected = targets.len();
        debug!("Broadcasting {} to {} peers", message.kind(), expected);

        let envelope_message = WireMessage::Broadcast {
            message: Box::new(message),
        };
        let mut sends = FuturesUnordered::new();
        for connection in targets {
            let payload = envelope_message.clone();
            sends.push(async move { connection.send(payload).await.is_ok() });
        }

        let mut num_success = 0;
        let mut num_faults = 0;
        let round = async {
            while let Some(ok) = sends.next().await {
                if ok {
                    num_success += 1;
                } else {
                    num_faults += 1;
                }
            }
        };
        let timeout = self.node.config().broadcast_timeout;
        if tokio::time::timeout(timeout, round).await.is_err() {
            return Err(BroadcastError::Timeout {
                settled: num_success + num_faults,
                expected,
            });
        }

        Ok(BroadcastResult {
            num_success,
            num_faults,
            elapsed: started.elapsed(),
        })
    }

    /// Resilience re-announcement: wait a short fixed delay, then broadcast
    /// at the default factor.
    pub async fn rebroadcast(&self, message: WireMessage) -> Result<BroadcastResult, BroadcastError> {
        tokio::time::sleep(self.node.config().rebroadcast_delay).await;
        self.broadcast_default(message).await
    }

    /// Shuffle-then-take selection over live, non-banned connections.
    fn select_targets(&self, factor: f64) -> Vec<Arc<Connection>> {
        use rand::seq::SliceRandom;
        let ban_list = self.node.ban_list();
        let mut connections: Vec<Arc<Connection>> = self
            .node
            .connections_snapshot()
            .into_iter()
            .filter(|connection| {
                connection
                    .peer_address()
                    .is_some_and(|address| !ban_list.is_banned(&address))
            })
            .collect();
        let count = num_targets(connections.len(), factor);
        connections.shuffle(&mut rand::rng());
        connections.truncate(count);
        connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_targets_rounding() {
        assert_eq!(num_targets(10, 0.5), 5);
        assert_eq!(num_targets(10, 0.75), 8); // 7.5 rounds up
        assert_eq!(num_targets(10, 0.74), 7); // 7.4 rounds down
        assert_eq!(num_targets(3, 0.5), 2); // 1.5 rounds up
    }

    #[test]
    fn test_num_targets_full_factor_hits_everyone() {
        for connected in 0..20 {
            assert_eq!(num_targets(connected, 1.0), connected);
        }
    }

    #[test]
    fn test_num_targets_bounded_by_connected() {
        assert_eq!(num_targets(4, 2.0), 4);
        assert_eq!(num_targets(4, 100.0), 4);
    }

    #[test]
    fn test_num_targets_degenerate_inputs() {
        assert_eq!(num_targets(0, 1.0), 0);
        assert_eq!(num_targets(10, 0.0), 0);
        assert_eq!(num_targets(10, -1.0), 0);
    }

    #[test]
    fn test_result_attempted_sum() {
        let result = BroadcastResult {
            num_success: 3,
            num_faults: 2,
            elapsed: Duration::from_millis(10),
        };
        assert_eq!(result.num_attempted(), 5);
    }
}

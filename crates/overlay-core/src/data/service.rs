//! Data gossip: wires admission to the broadcaster.
//!
//! Outbound: `publish` admits a record locally and fans the add request
//! out to connected peers. Inbound: add/remove requests arriving from the
//! network pass through admission, and newly admitted records are
//! rebroadcast after a short delay so gossip keeps spreading.

use super::admission::{AdmissionService, RejectReason};
use super::registry::{DecodeError, DecoderRegistry};
use super::{AddDataRequest, DataEntry, RemoveDataRequest};
use crate::broadcast::{BroadcastError, BroadcastResult, Broadcaster};
use crate::envelope::WireMessage;
use crate::listeners::Subscription;
use crate::node::{Node, NodeEvent};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("Record was refused admission: {0}")]
    Rejected(#[from] RejectReason),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

/// Gossip endpoint for distributed data.
pub struct DataGossipService {
    admission: Arc<AdmissionService>,
    broadcaster: Arc<Broadcaster>,
    registry: Arc<DecoderRegistry>,
    subscriptions: Mutex<Vec<Subscription<NodeEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DataGossipService {
    pub fn new(
        node: Arc<Node>,
        admission: Arc<AdmissionService>,
        broadcaster: Arc<Broadcaster>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            admission,
            broadcaster,
            registry: Arc::new(DecoderRegistry::new()),
            subscriptions: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        });

        // Data requests are admitted off the dispatch path so a slow
        // rebroadcast never stalls the node's event loop.
        let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
        let subscription = node.listeners().subscribe(move |event| {
            if let NodeEvent::Message { message, .. } = event
                && matches!(
                    message,
                    WireMessage::AddData(_) | WireMessage::RemoveData(_)
                )
            {
                let _ = tx.send(message);
            }
        });
        service
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscription);

        let worker = Arc::downgrade(&service);
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(service) = worker.upgrade() else {
                    break;
                };
                service.handle_inbound(message);
            }
        });
        *service.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        service
    }

    pub fn admission(&self) -> &Arc<AdmissionService> {
        &self.admission
    }

    /// Decoder registry for the application payloads this node
    /// understands. Register decoders here at startup.
    pub fn registry(&self) -> &Arc<DecoderRegistry> {
        &self.registry
    }

    /// Decode an admitted record's payload via its type tag.
    pub fn decode(
        &self,
        entry: &DataEntry,
    ) -> Result<Box<dyn std::any::Any + Send>, DecodeError> {
        let data = entry.data();
        self.registry.decode(&data.meta.tag, &data.payload)
    }

    /// Admit a locally produced record and fan it out at the default
    /// distribution factor.
    pub async fn publish(
        &self,
        entry: DataEntry,
        sequence: u64,
    ) -> Result<BroadcastResult, PublishError> {
        let request = AddDataRequest { entry, sequence };
        self.admission.admit_add(&request)?;
        info!("Publishing data record {}", request.entry.id());
        let result = self
            .broadcaster
            .broadcast_default(WireMessage::AddData(request))
            .await?;
        Ok(result)
    }

    /// Admit a locally produced removal and fan it out.
    pub async fn publish_removal(
        &self,
        request: RemoveDataRequest,
    ) -> Result<BroadcastResult, PublishError> {
        self.admission.admit_remove(&request)?;
        info!("Publishing removal of {}", request.id);
        let result = self
            .broadcaster
            .broadcast_default(WireMessage::RemoveData(request))
            .await?;
        Ok(result)
    }

    fn handle_inbound(self: &Arc<Self>, message: WireMessage) {
        match message {
            WireMessage::AddData(request) => match self.admission.admit_add(&request) {
                Ok(true) => {
                    debug!("Admitted {}; rebroadcasting", request.entry.id());
                    let broadcaster = Arc::clone(&self.broadcaster);
                    tokio::spawn(async move {
                        let _ = broadcaster
                            .rebroadcast(WireMessage::AddData(request))
                            .await;
                    });
                }
                Ok(false) => {
                    // Known record, sequence refreshed; gossip stops here
                }
                Err(reason) => {
                    debug!("Rejected add request: {}", reason);
                }
            },
            WireMessage::RemoveData(request) => match self.admission.admit_remove(&request) {
                Ok(true) => {
                    debug!("Removed {}; rebroadcasting", request.id);
                    let broadcaster = Arc::clone(&self.broadcaster);
                    tokio::spawn(async move {
                        let _ = broadcaster
                            .rebroadcast(WireMessage::RemoveData(request))
                            .await;
                    });
                }
                Ok(false) => {}
                Err(reason) => {
                    debug!("Rejected remove request: {}", reason);
                }
            },
            _ => {}
        }
    }
}

impl Drop for DataGossipService {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

//! Address validation: the anti-spoofing challenge-response handshake.
//!
//! When a peer connects inbound and claims a listening address, we confirm
//! the claim by opening a fresh outbound connection to that address and
//! challenging it with a random nonce. Only the node actually reachable at
//! the address can echo the nonce back.
//!
//! State machine per claimed address:
//! `REQUESTING -> AWAITING_RESPONSE -> { VALIDATED | FAILED }`, with
//! `FAILED` reached directly from `REQUESTING` on dial failure. Timeouts
//! resolve to `FAILED` so no validation is left pending forever.
//!
//! On failure both implicated addresses (the claimed one and the one the
//! responder reported) are banned and both connections are closed.

use crate::Address;
use crate::ban::BanReason;
use crate::connection::{CloseReason, Connection, ConnectionDirection};
use crate::envelope::{CloseAnnouncement, WireMessage};
use crate::listeners::Subscription;
use crate::node::{Node, NodeEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Progress of one address validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    /// Dialing the claimed address
    Requesting,
    /// Challenge sent, waiting for the nonce echo
    AwaitingResponse,
    /// The claim checked out
    Validated,
    /// The claim did not check out; both addresses are banned
    Failed,
}

/// Final outcome reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// This call ran the protocol and the address checked out
    Validated,
    /// A previous validation already settled this address
    AlreadyValidated,
    /// Another validation of the same address is underway; nothing to do
    InProgress,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Inbound connection has not claimed an address")]
    NoClaimedAddress,
    #[error("Dialing the claimed address failed: {0}")]
    DialFailed(String),
    #[error("Sending the challenge failed")]
    SendFailed,
    #[error("Peer echoed a wrong nonce")]
    MismatchedNonce,
    #[error("Peer reported address {reported} instead of {expected}")]
    AddressMismatch { expected: Address, reported: Address },
    #[error("Validation connection closed before the response arrived")]
    ConnectionFault,
    #[error("Validation timed out")]
    Timeout,
}

struct PendingValidation {
    nonce: u64,
    tx: oneshot::Sender<Result<(u64, Address), ValidationError>>,
}

/// Runs the validation protocol and keeps per-address state so each
/// address is validated at most once.
pub struct AddressValidator {
    node: Arc<Node>,
    timeout: Duration,
    /// Pending challenges keyed by validation-connection id.
    pending: Mutex<HashMap<String, PendingValidation>>,
    states: RwLock<HashMap<Address, ValidationState>>,
    subscriptions: Mutex<Vec<Subscription<NodeEvent>>>,
}

impl AddressValidator {
    /// Create the validator and attach it to the node: proof responses are
    /// routed to pending validations, and every unverified inbound
    /// connection triggers a validation attempt.
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        let validator = Arc::new(Self {
            timeout: node.config().validation_timeout,
            node,
            pending: Mutex::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&validator);
        let subscription = validator.node.listeners().subscribe(move |event| {
            if let Some(validator) = weak.upgrade() {
                validator.on_node_event(event);
            }
        });
        validator
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscription);
        validator
    }

    pub fn state(&self, address: &Address) -> Option<ValidationState> {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .copied()
    }

    pub fn is_in_progress(&self, address: &Address) -> bool {
        matches!(
            self.state(address),
            Some(ValidationState::Requesting | ValidationState::AwaitingResponse)
        )
    }

    fn on_node_event(self: &Arc<Self>, event: NodeEvent) {
        match event {
            NodeEvent::Message {
                connection,
                message: WireMessage::AddressProof { nonce, address },
            } => {
                let pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(connection.id());
                if let Some(pending) = pending {
                    let _ = pending.tx.send(Ok((nonce, address)));
                } else {
                    debug!(
                        "Unsolicited address proof on {}; ignoring",
                        connection.id()
                    );
                }
            }
            NodeEvent::ConnectionClosed { connection, .. } => {
                let pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(connection.id());
                if let Some(pending) = pending {
                    let _ = pending.tx.send(Err(ValidationError::ConnectionFault));
                }
            }
            NodeEvent::ConnectionOpened(connection) => {
                if connection.direction() == ConnectionDirection::Inbound
                    && !connection.is_verified()
                    && connection.peer_address().is_some()
                {
                    let validator = Arc::clone(self);
                    tokio::spawn(async move {
                        let _ = validator.validate(connection).await;
                    });
                }
            }
            _ => {}
        }
    }

    /// Validate the address claimed by an inbound connection.
    ///
    /// The returned future completes exactly once: success, failure, or
    /// exceptionally on a transport fault or timeout. Re-validating an
    /// already settled or in-flight address is a no-op.
    pub async fn validate(
        self: &Arc<Self>,
        inbound: Arc<Connection>,
    ) -> Result<ValidationOutcome, ValidationError> {
        let claimed = inbound
            .peer_address()
            .ok_or(ValidationError::NoClaimedAddress)?;

        {
            let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
            match states.get(&claimed) {
                Some(ValidationState::Validated) => {
                    inbound.mark_verified();
                    return Ok(ValidationOutcome::AlreadyValidated);
                }
                Some(ValidationState::Requesting | ValidationState::AwaitingResponse) => {
                    return Ok(ValidationOutcome::InProgress);
                }
                _ => {
                    states.insert(claimed.clone(), ValidationState::Requesting);
                }
            }
        }

        // A verified connection to the claimed address proves reachability
        // already; no need for a challenge round.
        if let Some(existing) = self.node.connection_to(&claimed)
            && existing.is_verified()
        {
            self.set_state(&claimed, ValidationState::Validated);
            inbound.mark_verified();
            return Ok(ValidationOutcome::AlreadyValidated);
        }

        debug!("Validating claimed address {}", claimed);
        let validation_conn = match self.node.open_validation_connection(&claimed).await {
            Ok(connection) => connection,
            Err(e) => {
                // REQUESTING -> FAILED without ever sending the challenge
                self.fail(&claimed, &inbound, None, None);
                return Err(ValidationError::DialFailed(e.to_string()));
            }
        };

        let nonce: u64 = {
            use rand::Rng;
            rand::rng().random()
        };
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                validation_conn.id().to_string(),
                PendingValidation { nonce, tx },
            );
        self.set_state(&claimed, ValidationState::AwaitingResponse);

        if validation_conn
            .send(WireMessage::ValidateAddress { nonce })
            .await
            .is_err()
        {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(validation_conn.id());
            self.fail(&claimed, &inbound, Some(&validation_conn), None);
            return Err(ValidationError::SendFailed);
        }

        let outcome = tokio::time::timeout(self.timeout, rx).await;
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(validation_conn.id());

        match outcome {
            Err(_elapsed) => {
                self.fail(&claimed, &inbound, Some(&validation_conn), None);
                Err(ValidationError::Timeout)
            }
            Ok(Err(_)) | Ok(Ok(Err(_))) => {
                self.fail(&claimed, &inbound, Some(&validation_conn), None);
                Err(ValidationError::ConnectionFault)
            }
            Ok(Ok(Ok((proof_nonce, proof_address)))) => {
                if proof_nonce == nonce && proof_address == claimed {
                    info!("Address {} validated", claimed);
                    self.set_state(&claimed, ValidationState::Validated);
                    inbound.mark_verified();
                    validation_conn
                        .close_gracefully(CloseAnnouncement::ValidationComplete)
                        .await;
                    Ok(ValidationOutcome::Validated)
                } else {
                    let error = if proof_nonce != nonce {
                        ValidationError::MismatchedNonce
                    } else {
                        ValidationError::AddressMismatch {
                            expected: claimed.clone(),
                            reported: proof_address.clone(),
                        }
                    };
                    self.fail(
                        &claimed,
                        &inbound,
                        Some(&validation_conn),
                        Some(proof_address),
                    );
                    Err(error)
                }
            }
        }
    }

    fn set_state(&self, address: &Address, state: ValidationState) {
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.clone(), state);
    }

    /// Failure path: ban both implicated addresses and close both
    /// connections.
    fn fail(
        &self,
        claimed: &Address,
        inbound: &Arc<Connection>,
        validation_conn: Option<&Arc<Connection>>,
        reported: Option<Address>,
    ) {
        warn!("Address validation for {} failed", claimed);
        self.set_state(claimed, ValidationState::Failed);

        let ban_list = self.node.ban_list();
        ban_list.ban(claimed.clone(), BanReason::AddressValidationFailed);
        if let Some(reported) = reported
            && reported != *claimed
        {
            ban_list.ban(reported, BanReason::AddressValidationFailed);
        }

        inbound.close(CloseReason::AddressValidationFailed);
        if let Some(validation_conn) = validation_conn {
            validation_conn.close(CloseReason::AddressValidationFailed);
        }
    }
}

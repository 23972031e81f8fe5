//! Inbound message routing.
//!
//! [`classify`] sorts message ids into the ranges RFC 4253 section 12
//! reserves: transport messages, key exchange method messages (30..=49),
//! and application messages (50 and up). The transport engine handles the
//! first two ranges itself; application payloads are forwarded to handlers
//! registered on a [`Dispatcher`].

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ssh::message::MessageId;

/// First message id of the key exchange method range.
pub const KEX_METHOD_RANGE_START: u8 = 30;

/// First message id above the transport layer.
pub const APPLICATION_RANGE_START: u8 = 50;

/// Which layer a message id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchClass {
    /// A known transport-layer message.
    Transport(MessageId),
    /// A key exchange method message (30..=49).
    KexMethod(u8),
    /// An application-layer message (50 and up).
    Application(u8),
    /// A transport-range id this implementation does not know.
    Unknown(u8),
}

/// Classifies a raw message id.
pub fn classify(id: u8) -> DispatchClass {
    if id >= APPLICATION_RANGE_START {
        return DispatchClass::Application(id);
    }
    match MessageId::from_u8(id) {
        Some(msg) if id >= KEX_METHOD_RANGE_START => DispatchClass::KexMethod(msg as u8),
        Some(msg) => DispatchClass::Transport(msg),
        None if id >= KEX_METHOD_RANGE_START => DispatchClass::KexMethod(id),
        None => DispatchClass::Unknown(id),
    }
}

/// Routes application-layer payloads to per-id channels.
///
/// Handlers register before the connection runs; a payload for an id with
/// no handler is reported back so the transport can answer with
/// SSH_MSG_UNIMPLEMENTED.
#[derive(Debug, Default)]
pub struct Dispatcher {
    handlers: HashMap<u8, mpsc::Sender<Vec<u8>>>,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for an application message id, returning the
    /// receiving end. Replaces any previous handler for the id.
    pub fn register(&mut self, id: u8, capacity: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity);
        if self.handlers.insert(id, tx).is_some() {
            warn!(id, "replacing application message handler");
        }
        rx
    }

    /// Whether a handler is registered for `id`.
    pub fn handles(&self, id: u8) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Delivers a payload. Returns `false` when no handler is registered
    /// or the handler has hung up.
    pub async fn dispatch(&self, id: u8, payload: Vec<u8>) -> bool {
        match self.handlers.get(&id) {
            Some(tx) => {
                debug!(id, len = payload.len(), "dispatching application message");
                tx.send(payload).await.is_ok()
            }
            None => {
                debug!(id, "no handler for application message");
                false
            }
        }
    }
}

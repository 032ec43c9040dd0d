//! Packet dispatch bus.
//!
//! Every inbound packet is published on two independent channels:
//!
//! - the **correlation-token channel**, keyed by the packet's sequence, a
//!   one-shot delivery that resolves a pending `send_and_wait`. Zero waiters
//!   is a legitimate, silent outcome.
//! - the **opcode-name channel**, the business-event fan-out built on the
//!   generic [`EventBus`]. The registry requires at least one handler here
//!   under the fatal policy.
//!
//! The two channels fire independently: one inbound packet can resolve a
//! pending wait and invoke a business handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use vaclink_core::bus::{DynError, EventBus, HandlerId};

use super::connection::Connection;
use super::error::{ProtocolError, ProtocolResult};
use super::packet::{Opcode, Packet};

/// What the registry does with a well-formed packet nobody handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledPolicy {
    /// Raise `No event handler found for packet event '<name>'` and tear the
    /// connection down. Reference behavior; keeps protocol coverage honest
    /// during development.
    #[default]
    Fatal,
    /// Log at warn level and skip. Production hardening: one unhandled
    /// manufacturer opcode should not cost a connection.
    Warn,
}

/// An inbound packet paired with the connection it arrived on.
#[derive(Clone)]
pub struct PacketMessage {
    /// The decoded packet.
    pub packet: Packet,
    /// Connection the packet arrived on; used to respond.
    pub connection: Arc<Connection>,
}

impl std::fmt::Debug for PacketMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketMessage")
            .field("packet", &self.packet)
            .field("connection", &self.connection.id())
            .finish()
    }
}

/// The dispatch bus: opcode-name fan-out plus one-shot token correlation.
#[derive(Default)]
pub struct PacketBus {
    events: EventBus<PacketMessage>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<PacketMessage>>>,
}

impl PacketBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a business handler for `opcode`.
    pub fn on<F, Fut>(&self, opcode: Opcode, handler: F) -> HandlerId
    where
        F: Fn(PacketMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        self.events.on(opcode.name(), handler)
    }

    /// Removes a business handler registration.
    pub fn off(&self, opcode: Opcode, id: HandlerId) -> bool {
        self.events.off(opcode.name(), id)
    }

    /// Number of business handlers registered for `opcode`.
    #[must_use]
    pub fn listener_count(&self, opcode: Opcode) -> usize {
        self.events.listener_count(opcode.name())
    }

    /// Publishes on the opcode-name channel, awaiting every handler.
    ///
    /// # Errors
    ///
    /// Propagates the first failing handler's error to the publisher.
    pub async fn emit(&self, opcode: Opcode, message: PacketMessage) -> ProtocolResult<()> {
        self.events
            .emit(opcode.name(), message)
            .await
            .map_err(ProtocolError::from)
    }

    /// Registers a one-shot waiter on the correlation token `sequence`.
    ///
    /// Called by `send_and_wait` BEFORE the request bytes are written, so a
    /// fast responder cannot publish the reply before the waiter exists.
    ///
    /// # Panics
    ///
    /// Panics if the waiter lock is poisoned.
    pub fn subscribe_token(&self, sequence: u64) -> oneshot::Receiver<PacketMessage> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .insert(sequence, tx);
        rx
    }

    /// Delivers `message` to the waiter on `sequence`, if any.
    ///
    /// Returns whether a waiter consumed the message. No waiter is silent:
    /// the token channel tolerates zero listeners.
    ///
    /// # Panics
    ///
    /// Panics if the waiter lock is poisoned.
    pub fn resolve_token(&self, sequence: u64, message: PacketMessage) -> bool {
        let waiter = self
            .waiters
            .lock()
            .expect("waiter lock poisoned")
            .remove(&sequence);
        match waiter {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Drops the waiter on `sequence`, failing its pending wait.
    ///
    /// Connection teardown calls this for every outstanding token so no
    /// `send_and_wait` is left un-resolvable.
    ///
    /// # Panics
    ///
    /// Panics if the waiter lock is poisoned.
    pub fn cancel_token(&self, sequence: u64) {
        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .remove(&sequence);
    }
}

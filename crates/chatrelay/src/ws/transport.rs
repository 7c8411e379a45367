//! Duplex transport abstraction shared by the client and backend sides.

use async_trait::async_trait;
use chatrelay_protocol::{Message, NewMessage};
use thiserror::Error;

/// Transport failures. Every variant is terminal for the pump that sees it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport was closed locally or by the peer.
    #[error("transport closed")]
    Closed,

    /// A read or write deadline passed.
    #[error("transport deadline exceeded")]
    Timeout,

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// A duplex channel with an explicit, idempotent close.
///
/// `recv` blocks until an item arrives or the transport ends. Closing from any
/// task releases a pending `recv` with [`TransportError::Closed`].
#[async_trait]
pub trait Transport: Send + Sync {
    type Inbound: Send;
    type Outbound: Send;

    async fn send(&self, item: Self::Outbound) -> Result<(), TransportError>;

    async fn recv(&self) -> Result<Self::Inbound, TransportError>;

    /// Close the transport. Only the first call has any effect.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// What the relay writes to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// An encoded JSON text frame.
    Text(String),
    /// Keepalive probe.
    Ping,
}

/// The upgraded socket to an end user. Inbound items are raw text frames.
pub type ClientTransport = dyn Transport<Inbound = String, Outbound = ServerFrame>;

/// The bidirectional stream to the chat backend. `close` ends the outbound
/// half (`CloseSend`) and releases a pending `recv`.
pub type BackendTransport = dyn Transport<Inbound = Message, Outbound = NewMessage>;

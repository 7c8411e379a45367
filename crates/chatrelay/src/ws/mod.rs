//! Real-time chat relay.
//!
//! Each accepted connection becomes a [`Session`] bridging the client's
//! WebSocket and a backend message stream. Sessions live in the [`WsHub`]
//! registry until one of their pumps fails.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         Browser clients                           │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 │ WebSocket (SocketTransport)
//! ┌───────────────────────────────▼───────────────────────────────────┐
//! │  Session                                                          │
//! │  - inbound pump:  client frames -> validate -> backend            │
//! │  - outbound pump: queue -> client, keepalive pings                │
//! │  - backend pump:  backend messages -> queue (overflow policy)     │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 │ BackendTransport (gRPC or local)
//! ┌───────────────────────────────▼───────────────────────────────────┐
//! │                          Chat backend                             │
//! └───────────────────────────────────────────────────────────────────┘
//!
//!   WsHub: single-owner registry actor (register / unregister / shutdown)
//! ```

mod handler;
mod hub;
pub mod memory;
mod queue;
mod session;
mod socket;
mod transport;

pub use handler::{ChatParams, chat_ws_handler, run_session};
pub use hub::{DuplicateSessionPolicy, HubError, WsHub};
pub use queue::{Enqueued, OutboundQueue, OverflowPolicy, QueueError, QueueReceiver};
pub use session::{Session, SessionId, SessionPumps, SessionState};
pub use socket::SocketTransport;
pub use transport::{BackendTransport, ClientTransport, ServerFrame, Transport, TransportError};

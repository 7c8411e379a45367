//! Wire types for the chat relay.
//!
//! Two boundaries are described here:
//!
//! ```text
//! Browser <--[WS: JSON text frames]--> chatrelay <--[gRPC bidi stream]--> chat backend
//! ```
//!
//! The client side speaks UTF-8 JSON text frames (`message`), the backend side
//! speaks protobuf (`grpc`). Content rules shared by both directions live in
//! `sanitize`.
//!
//! ## Frame shapes
//!
//! - Outbound chat message: `{"username": "...", "content": "...", "creationDate": "<RFC3339>"}`
//! - Inbound chat message: `{"content": "..."}` (other fields are ignored)
//! - Error: `{"error": "<CODE>"}`

use std::time::Duration;

pub mod grpc;
pub mod message;
pub mod sanitize;

pub use message::{
    CodecError, ErrorCode, ErrorFrame, InboundFrame, Message, NewMessage, decode_inbound,
    decode_message, encode_error, encode_message,
};
pub use sanitize::{ContentError, sanitize, validate_content};

/// Largest accepted message content, in bytes, after sanitization.
pub const MAX_CONTENT_BYTES: usize = 256;

/// Largest inbound text frame the relay decodes.
pub const MAX_FRAME_BYTES: usize = 4096;

/// Default capacity of a session's outbound queue.
pub const QUEUE_CAPACITY: usize = 256;

/// Time allowed to write one frame to the client.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between two keepalive acknowledgements from the client.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Keepalive probe interval. Must stay below [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

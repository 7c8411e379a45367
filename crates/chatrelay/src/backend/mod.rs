//! Chat backend adapters.
//!
//! The relay needs two things from a chat backend: a preparation call that
//! admits a user to a chat, and a duplex message stream for that chat.
//!
//! ```text
//! ┌──────────────┐  prepare_stream(user, chat)   ┌──────────────────────┐
//! │   chatrelay  │ ─────────────────────────────▶│     ChatBackend      │
//! │              │  open_stream(user, chat)      │  ┌────────────────┐  │
//! │              │ ◀────── BackendTransport ─────│  │ GrpcChatBackend│  │
//! └──────────────┘                               │  │LocalChatBackend│  │
//!                                                │  └────────────────┘  │
//!                                                └──────────────────────┘
//! ```

mod grpc;
mod local;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::ws::BackendTransport;

pub use grpc::GrpcChatBackend;
pub use local::LocalChatBackend;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("chat not found: {0}")]
    ChatNotFound(String),

    #[error("chat stream not prepared: {0}")]
    StreamNotPrepared(String),

    #[error("chat backend unavailable: {0}")]
    Unavailable(String),

    #[error("chat backend error: {0}")]
    Rpc(String),
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Admit `username` to `chat_id`. Must precede [`ChatBackend::open_stream`].
    async fn prepare_stream(&self, username: &str, chat_id: &str) -> Result<(), BackendError>;

    /// Open the duplex message stream for a prepared chat.
    async fn open_stream(
        &self,
        username: &str,
        chat_id: &str,
    ) -> Result<Arc<BackendTransport>, BackendError>;
}

//! In-process chat backend.
//!
//! Every stream opened for a chat sees every message sent to that chat,
//! including its own. Nothing is persisted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatrelay_protocol::{Message, NewMessage};
use log::{debug, info, warn};
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};

use super::{BackendError, ChatBackend};
use crate::ws::{BackendTransport, Transport, TransportError};

/// Per-chat fan-out buffer.
const CHAT_BUFFER_SIZE: usize = 256;

#[derive(Default)]
struct Chats {
    channels: HashMap<String, broadcast::Sender<Message>>,
    prepared: HashSet<(String, String)>,
}

pub struct LocalChatBackend {
    /// When set, only these chat ids exist.
    allowed: Option<HashSet<String>>,
    chats: Mutex<Chats>,
}

impl LocalChatBackend {
    /// A backend where any non-empty chat id exists.
    pub fn new() -> Self {
        Self {
            allowed: None,
            chats: Mutex::new(Chats::default()),
        }
    }

    /// A backend where only `chats` exist.
    pub fn with_chats<I, S>(chats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(chats.into_iter().map(Into::into).collect()),
            chats: Mutex::new(Chats::default()),
        }
    }

    fn chats(&self) -> std::sync::MutexGuard<'_, Chats> {
        match self.chats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn exists(&self, chat_id: &str) -> bool {
        !chat_id.is_empty()
            && self
                .allowed
                .as_ref()
                .is_none_or(|allowed| allowed.contains(chat_id))
    }
}

impl Default for LocalChatBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatBackend for LocalChatBackend {
    async fn prepare_stream(&self, username: &str, chat_id: &str) -> Result<(), BackendError> {
        if !self.exists(chat_id) {
            return Err(BackendError::ChatNotFound(chat_id.to_string()));
        }
        let mut chats = self.chats();
        chats
            .channels
            .entry(chat_id.to_string())
            .or_insert_with(|| broadcast::channel(CHAT_BUFFER_SIZE).0);
        chats
            .prepared
            .insert((username.to_string(), chat_id.to_string()));
        debug!("prepared local chat stream {} for {}", chat_id, username);
        Ok(())
    }

    async fn open_stream(
        &self,
        username: &str,
        chat_id: &str,
    ) -> Result<Arc<BackendTransport>, BackendError> {
        let mut chats = self.chats();
        // A preparation is consumed by the stream it was made for.
        if !chats
            .prepared
            .remove(&(username.to_string(), chat_id.to_string()))
        {
            return Err(BackendError::StreamNotPrepared(chat_id.to_string()));
        }
        let sender = chats
            .channels
            .entry(chat_id.to_string())
            .or_insert_with(|| broadcast::channel(CHAT_BUFFER_SIZE).0)
            .clone();
        let receiver = sender.subscribe();
        chats
            .channels
            .retain(|_, channel| channel.receiver_count() > 0);
        info!("opened local chat stream {} for {}", chat_id, username);

        let (closed, _) = watch::channel(false);
        let stream: Arc<BackendTransport> = Arc::new(LocalStream {
            chat_id: chat_id.to_string(),
            sender,
            receiver: AsyncMutex::new(receiver),
            closed,
        });
        Ok(stream)
    }
}

struct LocalStream {
    chat_id: String,
    sender: broadcast::Sender<Message>,
    receiver: AsyncMutex<broadcast::Receiver<Message>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Transport for LocalStream {
    type Inbound = Message;
    type Outbound = NewMessage;

    async fn send(&self, message: NewMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        // Send only fails when no stream is subscribed, which cannot be the
        // case while this one is open.
        let _ = self
            .sender
            .send(Message::new(message.username, message.content));
        Ok(())
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut receiver = self.receiver.lock().await;
        loop {
            tokio::select! {
                _ = closed.wait_for(|closed| *closed) => return Err(TransportError::Closed),
                res = receiver.recv() => match res {
                    Ok(message) => return Ok(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("local chat {} stream lagged, skipped {} message(s)", self.chat_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
                },
            }
        }
    }

    async fn close(&self) {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_chat_is_not_found() {
        let backend = LocalChatBackend::with_chats(["general"]);
        assert_eq!(
            backend.prepare_stream("alice", "random").await,
            Err(BackendError::ChatNotFound("random".to_string()))
        );
        assert!(matches!(
            LocalChatBackend::new().prepare_stream("alice", "").await,
            Err(BackendError::ChatNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_requires_prepare() {
        let backend = LocalChatBackend::new();
        assert!(matches!(
            backend.open_stream("alice", "general").await,
            Err(BackendError::StreamNotPrepared(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_fan_out_to_chat_members() {
        let backend = LocalChatBackend::new();
        backend.prepare_stream("alice", "general").await.unwrap();
        backend.prepare_stream("bob", "general").await.unwrap();
        let alice = backend.open_stream("alice", "general").await.unwrap();
        let bob = backend.open_stream("bob", "general").await.unwrap();

        alice
            .send(NewMessage {
                username: "alice".to_string(),
                content: "hi bob".to_string(),
            })
            .await
            .unwrap();

        let seen_by_bob = bob.recv().await.unwrap();
        assert_eq!(seen_by_bob.username, "alice");
        assert_eq!(seen_by_bob.content, "hi bob");
        assert_eq!(alice.recv().await.unwrap().content, "hi bob");
    }

    #[tokio::test]
    async fn test_preparation_is_consumed_by_open() {
        let backend = LocalChatBackend::new();
        backend.prepare_stream("alice", "general").await.unwrap();
        let _stream = backend.open_stream("alice", "general").await.unwrap();

        assert!(backend.chats().prepared.is_empty());
        assert!(matches!(
            backend.open_stream("alice", "general").await,
            Err(BackendError::StreamNotPrepared(_))
        ));
    }

    #[tokio::test]
    async fn test_chats_without_streams_are_dropped() {
        let backend = LocalChatBackend::new();
        backend.prepare_stream("alice", "general").await.unwrap();
        let general = backend.open_stream("alice", "general").await.unwrap();
        drop(general);

        backend.prepare_stream("alice", "random").await.unwrap();
        let _random = backend.open_stream("alice", "random").await.unwrap();

        let chats = backend.chats();
        assert!(!chats.channels.contains_key("general"));
        assert!(chats.channels.contains_key("random"));
    }

    #[tokio::test]
    async fn test_close_send_releases_recv() {
        let backend = LocalChatBackend::new();
        backend.prepare_stream("alice", "general").await.unwrap();
        let stream = backend.open_stream("alice", "general").await.unwrap();

        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.recv().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stream.close().await;
        stream.close().await;

        assert_eq!(reader.await.unwrap(), Err(TransportError::Closed));
        assert!(
            stream
                .send(NewMessage {
                    username: "alice".to_string(),
                    content: "late".to_string(),
                })
                .await
                .is_err()
        );
    }
}

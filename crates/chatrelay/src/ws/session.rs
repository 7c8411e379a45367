//! One relayed connection: a client transport, a backend stream and the three
//! pumps moving data between them.
//!
//! ```text
//!            inbound pump                    backend-receive pump
//! client ──────────────────▶ backend ──────────────────────────▶ queue
//!   ▲                                                              │
//!   └───────────────────────── outbound pump ◀─────────────────────┘
//! ```
//!
//! Any pump that hits a terminal condition fires the disconnect signal. The
//! acceptor waits on that signal and unregisters the session; the registry
//! then calls [`Session::close`], which closes the queue and both transports
//! and so releases every pump still parked in a read or write.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chatrelay_protocol::{
    ErrorCode, NewMessage, decode_inbound, encode_error, encode_message, validate_content,
};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use uuid::Uuid;

use crate::config::RelayConfig;

use super::queue::{Enqueued, OutboundQueue, QueueError, QueueReceiver};
use super::transport::{BackendTransport, ClientTransport, ServerFrame, TransportError};

/// Registry key of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Active = 0,
    Disconnecting = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Disconnecting,
            _ => Self::Closed,
        }
    }
}

pub struct Session {
    id: SessionId,
    username: String,
    chat_id: String,
    client: Arc<ClientTransport>,
    backend: Arc<BackendTransport>,
    queue: OutboundQueue,
    receiver: StdMutex<Option<QueueReceiver>>,
    config: RelayConfig,
    state: AtomicU8,
    disconnect: watch::Sender<bool>,
    closed: AtomicBool,
    /// False while an outbound pump is running.
    outbound_idle: watch::Sender<bool>,
}

/// Join handles of a started session's pumps.
pub struct SessionPumps {
    handles: Vec<JoinHandle<()>>,
}

impl SessionPumps {
    /// Wait for every pump to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("session pump failed: {}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Session {
    pub fn new(
        username: impl Into<String>,
        chat_id: impl Into<String>,
        client: Arc<ClientTransport>,
        backend: Arc<BackendTransport>,
        config: RelayConfig,
    ) -> Self {
        let (queue, receiver) = OutboundQueue::new(config.queue_capacity, config.overflow_policy);
        let (disconnect, _) = watch::channel(false);
        let (outbound_idle, _) = watch::channel(true);
        Self {
            id: SessionId::new(),
            username: username.into(),
            chat_id: chat_id.into(),
            client,
            backend,
            queue,
            receiver: StdMutex::new(Some(receiver)),
            config,
            state: AtomicU8::new(SessionState::Active as u8),
            disconnect,
            closed: AtomicBool::new(false),
            outbound_idle,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn client(&self) -> &Arc<ClientTransport> {
        &self.client
    }

    pub fn backend(&self) -> &Arc<BackendTransport> {
        &self.backend
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Frames discarded because the client could not keep up.
    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped()
    }

    /// True once both transports are closed.
    pub fn transports_closed(&self) -> bool {
        self.client.is_closed() && self.backend.is_closed()
    }

    /// Fire the disconnect signal. Returns true only for the first caller,
    /// however many pumps race here.
    pub fn trigger_disconnect(&self) -> bool {
        let fired = self.disconnect.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        });
        if fired {
            let _ = self.state.compare_exchange(
                SessionState::Active as u8,
                SessionState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            debug!("session {} ({}) disconnecting", self.id, self.username);
        }
        fired
    }

    pub fn is_disconnected(&self) -> bool {
        *self.disconnect.borrow()
    }

    /// Resolve once the disconnect signal has fired.
    pub async fn disconnected(&self) {
        let mut rx = self.disconnect.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Spawn the inbound, outbound and backend-receive pumps.
    ///
    /// Starting twice, or starting a session that is already closed, spawns
    /// nothing.
    pub fn start(self: &Arc<Self>) -> SessionPumps {
        let receiver = match self.receiver.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(receiver) = receiver else {
            return SessionPumps { handles: vec![] };
        };
        if self.closed.load(Ordering::Acquire) {
            return SessionPumps { handles: vec![] };
        }

        self.outbound_idle.send_replace(false);
        let handles = vec![
            tokio::spawn(self.clone().inbound_pump()),
            tokio::spawn(self.clone().outbound_pump(receiver)),
            tokio::spawn(self.clone().backend_pump()),
        ];
        info!(
            "session {} started for {} in chat {}",
            self.id, self.username, self.chat_id
        );
        SessionPumps { handles }
    }

    /// Tear the session down: fire the disconnect signal, close the queue, give
    /// the outbound pump up to one write deadline to flush and send the close
    /// frame, then close both transports.
    ///
    /// Returns true only for the call that performed the teardown.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.trigger_disconnect();
        self.queue.close();

        let mut idle = self.outbound_idle.subscribe();
        if timeout(self.config.write_wait(), idle.wait_for(|idle| *idle))
            .await
            .is_err()
        {
            debug!("session {} outbound pump did not flush in time", self.id);
        }

        self.client.close().await;
        self.backend.close().await;
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);

        let dropped = self.queue.dropped();
        if dropped > 0 {
            info!(
                "session {} closed, {} frame(s) dropped for a slow client",
                self.id, dropped
            );
        } else {
            debug!("session {} closed", self.id);
        }
        true
    }

    /// Queue an error frame for the client. Best effort.
    ///
    /// Returns whether the inbound pump keeps reading.
    async fn report(&self, code: ErrorCode) -> bool {
        if let Err(e) = self.queue.enqueue(encode_error(code)).await {
            debug!("session {}: error frame {} not queued: {}", self.id, code, e);
        }
        code.is_recoverable()
    }

    async fn inbound_pump(self: Arc<Self>) {
        loop {
            let frame = match self.client.recv().await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("session {} client read ended: {}", self.id, e);
                    break;
                }
            };

            if frame.len() > self.config.max_frame_bytes {
                debug!(
                    "session {} frame of {} bytes over limit",
                    self.id,
                    frame.len()
                );
                if self.report(ErrorCode::FrameTooLarge).await {
                    continue;
                }
                break;
            }

            let inbound = match decode_inbound(&frame) {
                Ok(inbound) => inbound,
                Err(e) => {
                    warn!("session {} sent a malformed frame: {}", self.id, e);
                    if self.report(ErrorCode::InvalidFrame).await {
                        continue;
                    }
                    break;
                }
            };

            let content = match validate_content(&inbound.content, self.config.max_content_bytes)
            {
                Ok(content) => content,
                Err(e) => {
                    debug!("session {} message rejected: {}", self.id, e);
                    if self.report(e.code()).await {
                        continue;
                    }
                    break;
                }
            };

            let message = NewMessage {
                username: self.username.clone(),
                content,
            };
            if let Err(e) = self.backend.send(message).await {
                debug!("session {} backend send failed: {}", self.id, e);
                break;
            }
        }
        self.trigger_disconnect();
    }

    async fn outbound_pump(self: Arc<Self>, mut receiver: QueueReceiver) {
        let period = self.config.ping_period();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                frame = receiver.next() => match frame {
                    Some(text) => {
                        if let Err(e) = self.write(ServerFrame::Text(text)).await {
                            debug!("session {} write failed: {}", self.id, e);
                            break;
                        }
                    }
                    None => {
                        self.client.close().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.write(ServerFrame::Ping).await {
                        debug!("session {} keepalive failed: {}", self.id, e);
                        break;
                    }
                }
            }
        }
        self.trigger_disconnect();
        self.outbound_idle.send_replace(true);
    }

    async fn write(&self, frame: ServerFrame) -> Result<(), TransportError> {
        match timeout(self.config.write_wait(), self.client.send(frame)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn backend_pump(self: Arc<Self>) {
        loop {
            let message = match self.backend.recv().await {
                Ok(message) => message,
                Err(e) => {
                    debug!("session {} backend stream ended: {}", self.id, e);
                    break;
                }
            };

            let frame = match encode_message(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("session {} could not encode message: {}", self.id, e);
                    continue;
                }
            };

            match self.queue.enqueue(frame).await {
                Ok(Enqueued::Queued) => {}
                Ok(Enqueued::Dropped) => {
                    debug!("session {} outbound queue full, message dropped", self.id);
                }
                Err(QueueError::Overflow) => {
                    warn!("session {} disconnected as a slow consumer", self.id);
                    break;
                }
                Err(QueueError::Closed) => break,
            }
        }
        self.trigger_disconnect();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("chat_id", &self.chat_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::memory::{self, MemoryPeer};
    use chatrelay_protocol::{Message, NewMessage};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type ClientPeer = MemoryPeer<String, ServerFrame>;
    type BackendPeer = MemoryPeer<Message, NewMessage>;

    fn session_with(config: RelayConfig) -> (Arc<Session>, ClientPeer, BackendPeer) {
        let (client, client_peer) = memory::pair::<String, ServerFrame>(64);
        let (backend, backend_peer) = memory::pair::<Message, NewMessage>(64);
        let session = Arc::new(Session::new(
            "alice",
            "general",
            Arc::new(client),
            Arc::new(backend),
            config,
        ));
        (session, client_peer, backend_peer)
    }

    #[tokio::test]
    async fn test_trigger_disconnect_fires_once_under_contention() {
        let (session, _client, _backend) = session_with(RelayConfig::default());
        let winners = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let session = session.clone();
            let winners = winners.clone();
            tasks.push(tokio::spawn(async move {
                if session.trigger_disconnect() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Disconnecting);
        assert!(session.is_disconnected());
    }

    #[tokio::test]
    async fn test_close_runs_once_and_closes_transports() {
        let (session, client, backend) = session_with(RelayConfig::default());
        let pumps = session.start();
        assert_eq!(pumps.len(), 3);

        let (first, second) = tokio::join!(session.close(), session.close());
        assert!(first ^ second);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.transports_closed());
        assert!(client.is_closed());
        assert!(backend.is_closed());

        tokio::time::timeout(Duration::from_secs(1), pumps.join())
            .await
            .expect("pumps exit after close");
    }

    #[tokio::test]
    async fn test_start_on_closed_session_spawns_nothing() {
        let (session, _client, _backend) = session_with(RelayConfig::default());
        session.close().await;
        assert!(session.start().is_empty());
    }

    #[tokio::test]
    async fn test_username_comes_from_session() {
        let (session, client, mut backend) = session_with(RelayConfig::default());
        let _pumps = session.start();

        client.send(r#"{"username":"mallory","content":"<b>hi</b>"}"#.to_string());
        let forwarded = backend.recv().await.unwrap();
        assert_eq!(
            forwarded,
            NewMessage {
                username: "alice".to_string(),
                content: "hi".to_string(),
            }
        );
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_probe_sent_when_idle() {
        let (session, mut client, _backend) = session_with(RelayConfig::default());
        let _pumps = session.start();

        let frame = client.recv().await.unwrap();
        assert_eq!(frame, ServerFrame::Ping);
        session.close().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_is_recoverable() {
        let (session, mut client, mut backend) = session_with(RelayConfig::default());
        let _pumps = session.start();

        let huge = format!(r#"{{"content":"{}"}}"#, "a".repeat(5000));
        client.send(huge);
        assert_eq!(
            client.recv_text().await.as_deref(),
            Some(r#"{"error":"FRAME_TOO_LARGE"}"#)
        );

        client.send(r#"{"content":"still here"}"#.to_string());
        assert_eq!(backend.recv().await.unwrap().content, "still here");
        assert!(!session.is_disconnected());
        session.close().await;
    }
}

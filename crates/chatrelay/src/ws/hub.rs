//! Registry of live sessions.
//!
//! The live set is owned by a single actor task. [`WsHub`] is a cheap handle
//! that turns register, unregister and shutdown into messages for that task,
//! so no lock ever guards the set.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use super::session::{Session, SessionId};

/// Capacity of each control channel.
const CONTROL_BUFFER_SIZE: usize = 64;

/// Whether one username may hold several live sessions at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateSessionPolicy {
    /// Several devices per user are fine.
    #[default]
    Allow,
    /// A second session for a username is refused while the first is live.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("hub is shut down")]
    ShutDown,

    #[error("user {0} already has a live session")]
    DuplicateSession(String),
}

struct RegisterRequest {
    session: Arc<Session>,
    reply: oneshot::Sender<Result<(), HubError>>,
}

struct UnregisterRequest {
    id: SessionId,
    reply: oneshot::Sender<bool>,
}

/// Handle to the registry actor.
#[derive(Clone)]
pub struct WsHub {
    register_tx: mpsc::Sender<RegisterRequest>,
    unregister_tx: mpsc::Sender<UnregisterRequest>,
    shutdown_tx: mpsc::Sender<oneshot::Sender<usize>>,
    live: watch::Receiver<usize>,
}

impl WsHub {
    /// Spawn the registry actor on the current runtime.
    pub fn spawn(policy: DuplicateSessionPolicy) -> Self {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_BUFFER_SIZE);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_BUFFER_SIZE);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (live_tx, live) = watch::channel(0);

        let registry = Registry {
            sessions: HashMap::new(),
            policy,
            register_rx,
            unregister_rx,
            shutdown_rx,
            live: live_tx,
            running: true,
        };
        tokio::spawn(registry.run());

        Self {
            register_tx,
            unregister_tx,
            shutdown_tx,
            live,
        }
    }

    /// Add a session to the live set.
    ///
    /// A rejected session is not closed here; the caller still owns it.
    pub async fn register(&self, session: Arc<Session>) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.register_tx
            .send(RegisterRequest { session, reply })
            .await
            .map_err(|_| HubError::ShutDown)?;
        rx.await.unwrap_or(Err(HubError::ShutDown))
    }

    /// Remove a session and close it.
    ///
    /// Returns true only for the call that removed it. When it returns true the
    /// session's queue and both transports are closed.
    pub async fn unregister(&self, session: &Session) -> bool {
        let (reply, rx) = oneshot::channel();
        let request = UnregisterRequest {
            id: session.id(),
            reply,
        };
        if self.unregister_tx.send(request).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Close every live session and stop accepting registrations.
    ///
    /// Returns how many sessions were closed; zero on every call after the first.
    pub async fn shutdown(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.shutdown_tx.send(reply).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Number of live sessions.
    pub fn live_sessions(&self) -> usize {
        *self.live.borrow()
    }

    /// Watch the live-session count.
    pub fn watch_live_sessions(&self) -> watch::Receiver<usize> {
        self.live.clone()
    }
}

/// The actor. Only `run` touches `sessions`.
struct Registry {
    sessions: HashMap<SessionId, Arc<Session>>,
    policy: DuplicateSessionPolicy,
    register_rx: mpsc::Receiver<RegisterRequest>,
    unregister_rx: mpsc::Receiver<UnregisterRequest>,
    shutdown_rx: mpsc::Receiver<oneshot::Sender<usize>>,
    live: watch::Sender<usize>,
    running: bool,
}

impl Registry {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(request) = self.register_rx.recv(), if self.running => {
                    self.register(request);
                }
                Some(request) = self.unregister_rx.recv(), if self.running => {
                    self.unregister(request);
                }
                request = self.shutdown_rx.recv() => match request {
                    Some(reply) => {
                        let closed = self.shutdown().await;
                        let _ = reply.send(closed);
                    }
                    None => break,
                },
            }
        }

        // Every handle is gone. Nothing can reach the live set any more.
        if self.running {
            self.shutdown().await;
        }
        debug!("session registry stopped");
    }

    fn register(&mut self, request: RegisterRequest) {
        let RegisterRequest { session, reply } = request;

        if self.policy == DuplicateSessionPolicy::Reject
            && self
                .sessions
                .values()
                .any(|live| live.username() == session.username())
        {
            info!(
                "rejected duplicate session {} for user {}",
                session.id(),
                session.username()
            );
            let _ = reply.send(Err(HubError::DuplicateSession(
                session.username().to_string(),
            )));
            return;
        }

        info!(
            "registered session {} for user {} in chat {}",
            session.id(),
            session.username(),
            session.chat_id()
        );
        self.sessions.insert(session.id(), session);
        self.publish();
        let _ = reply.send(Ok(()));
    }

    fn unregister(&mut self, request: UnregisterRequest) {
        let UnregisterRequest { id, reply } = request;
        let Some(session) = self.sessions.remove(&id) else {
            let _ = reply.send(false);
            return;
        };
        info!("unregistered session {} for user {}", id, session.username());
        self.publish();

        // Closing waits on the outbound flush; keep the loop free meanwhile.
        tokio::spawn(async move {
            session.close().await;
            let _ = reply.send(true);
        });
    }

    async fn shutdown(&mut self) -> usize {
        if !self.running {
            return 0;
        }
        self.running = false;
        self.register_rx.close();
        self.unregister_rx.close();

        let sessions: Vec<_> = self.sessions.drain().map(|(_, session)| session).collect();
        let count = sessions.len();
        info!("shutting down {} live session(s)", count);
        join_all(sessions.iter().map(|session| session.close())).await;
        self.publish();

        // Requests that were queued before the channels closed.
        while let Ok(request) = self.register_rx.try_recv() {
            let _ = request.reply.send(Err(HubError::ShutDown));
        }
        while let Ok(request) = self.unregister_rx.try_recv() {
            let _ = request.reply.send(false);
        }

        if count > 0 {
            warn!("closed {} session(s) on shutdown", count);
        }
        count
    }

    fn publish(&self) {
        self.live.send_replace(self.sessions.len());
    }
}

//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::backend::ChatBackend;
use crate::config::RelayConfig;
use crate::ws::WsHub;

#[derive(Clone)]
pub struct AppState {
    /// Registry of live chat sessions.
    pub hub: WsHub,
    pub backend: Arc<dyn ChatBackend>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub relay: Arc<RelayConfig>,
}

impl AppState {
    /// Build the state and spawn the session registry.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        verifier: Arc<dyn TokenVerifier>,
        relay: RelayConfig,
    ) -> Self {
        Self {
            hub: WsHub::spawn(relay.duplicate_sessions),
            backend,
            verifier,
            relay: Arc::new(relay),
        }
    }
}

//! Chat endpoint and the per-connection accept lifecycle.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{
        HeaderMap,
        header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL},
    },
    response::Response,
};
use chatrelay_protocol::{ErrorCode, encode_error};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::api::{ApiError, AppState};
use crate::auth::{AuthError, bearer_token_from_header, token_from_subprotocols};
use crate::config::RelayConfig;

use super::hub::{HubError, WsHub};
use super::session::Session;
use super::socket::SocketTransport;
use super::transport::{BackendTransport, ClientTransport, ServerFrame};

#[derive(Debug, Default, Deserialize)]
pub struct ChatParams {
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
    /// Fallback for clients that can set neither headers nor subprotocols.
    pub token: Option<String>,
}

/// Where the bearer credential was found.
enum Credential {
    /// Offered as a WebSocket subprotocol; must be echoed back on upgrade.
    Subprotocol(String),
    Header(String),
    Query(String),
}

impl Credential {
    fn token(&self) -> &str {
        match self {
            Self::Subprotocol(token) | Self::Header(token) | Self::Query(token) => token,
        }
    }
}

fn credential(headers: &HeaderMap, params: &ChatParams) -> Result<Credential, AuthError> {
    if let Some(token) = headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(token_from_subprotocols)
    {
        return Ok(Credential::Subprotocol(token.to_string()));
    }

    if let Some(value) = headers.get(AUTHORIZATION) {
        let value = value.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
        return bearer_token_from_header(value).map(|token| Credential::Header(token.to_string()));
    }

    params
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .map(|token| Credential::Query(token.to_string()))
        .ok_or(AuthError::MissingToken)
}

/// WebSocket upgrade handler.
///
/// GET /chat?chatId=<id>
///
/// Authentication and stream preparation happen before the upgrade so their
/// failures reach the caller as HTTP errors.
pub async fn chat_ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ChatParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let credential = credential(&headers, &params)?;
    let username = state.verifier.verify(credential.token()).await?;

    let chat_id = params
        .chat_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing chatId query parameter"))?;
    info!("chat upgrade request from {} for chat {}", username, chat_id);

    state.backend.prepare_stream(&username, &chat_id).await?;

    let ws = ws.map_err(|e| ApiError::bad_request(format!("websocket upgrade required: {e}")))?;
    let backend = state.backend.open_stream(&username, &chat_id).await?;

    let limit = state.relay.socket_message_limit();
    let mut ws = ws.max_message_size(limit).max_frame_size(limit);
    if let Credential::Subprotocol(token) = credential {
        ws = ws.protocols([token]);
    }

    let on_failed = backend.clone();
    let relay = state.relay.clone();
    let hub = state.hub.clone();
    Ok(ws
        .on_failed_upgrade(move |e| {
            warn!("websocket upgrade failed: {}", e);
            tokio::spawn(async move { on_failed.close().await });
        })
        .on_upgrade(move |socket| async move {
            let client: Arc<ClientTransport> = Arc::new(SocketTransport::new(
                socket,
                relay.pong_wait(),
                relay.write_wait(),
            ));
            run_session(&hub, relay.as_ref().clone(), username, chat_id, client, backend).await;
        }))
}

/// Drive one connection from registration to release.
///
/// Registers the session, starts its pumps, waits for the disconnect signal,
/// unregisters (which closes both transports) and waits for the pumps to exit.
pub async fn run_session(
    hub: &WsHub,
    config: RelayConfig,
    username: String,
    chat_id: String,
    client: Arc<ClientTransport>,
    backend: Arc<BackendTransport>,
) {
    let write_wait = config.write_wait();
    let session = Arc::new(Session::new(username, chat_id, client, backend, config));

    if let Err(err) = hub.register(session.clone()).await {
        warn!("session {} not registered: {}", session.id(), err);
        if let HubError::DuplicateSession(_) = err {
            let frame = ServerFrame::Text(encode_error(ErrorCode::SessionAlreadyOpen));
            let _ = tokio::time::timeout(write_wait, session.client().send(frame)).await;
        }
        session.close().await;
        return;
    }

    let pumps = session.start();
    session.disconnected().await;

    if !hub.unregister(&session).await {
        // Released by a registry shutdown; make sure teardown has run.
        session.close().await;
    }
    pumps.join().await;
    debug!(
        "session {} for {} finished, {} frame(s) dropped",
        session.id(),
        session.username(),
        session.dropped_frames()
    );
}

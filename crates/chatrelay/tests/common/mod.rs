//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use chatrelay::api::{self, AppState};
use chatrelay::auth::{Claims, JwtVerifier};
use chatrelay::backend::LocalChatBackend;
use chatrelay::config::RelayConfig;
use jsonwebtoken::{EncodingKey, Header, encode};
use tokio::net::TcpListener;

pub const TEST_SECRET: &str = "test-secret-for-integration-tests-minimum-32-chars";

/// The only chat the test backend knows.
pub const TEST_CHAT: &str = "general";

/// Sign a token for `sub` that expires in an hour.
pub fn token(sub: &str) -> String {
    signed(sub, chrono::Utc::now().timestamp() + 3600)
}

pub fn expired_token(sub: &str) -> String {
    signed(sub, chrono::Utc::now().timestamp() - 3600)
}

fn signed(sub: &str, exp: i64) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("sign test token")
}

pub fn test_state() -> AppState {
    AppState::new(
        Arc::new(LocalChatBackend::with_chats([TEST_CHAT])),
        Arc::new(JwtVerifier::new(TEST_SECRET)),
        RelayConfig::default(),
    )
}

pub async fn test_app() -> Router {
    api::create_router(test_state())
}

/// Serve the router on an ephemeral port.
pub async fn spawn_server() -> (SocketAddr, AppState) {
    let state = test_state();
    let app = api::create_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test app");
    });
    (addr, state)
}

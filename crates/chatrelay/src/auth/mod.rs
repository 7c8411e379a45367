//! Token verification for incoming connections.
//!
//! The relay does not issue tokens. It only turns a bearer credential into the
//! username a session acts as.

mod error;
mod token;

use async_trait::async_trait;

pub use error::AuthError;
pub use token::{Claims, JwtVerifier, bearer_token_from_header, token_from_subprotocols};

/// Resolves a bearer credential to a username.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, AuthError>;
}

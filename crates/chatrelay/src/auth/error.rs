//! Authentication errors.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential in the subprotocol, header or query.
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    #[error("internal auth error: {0}")]
    Internal(String),
}

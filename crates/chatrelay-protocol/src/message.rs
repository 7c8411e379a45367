//! Client-facing JSON frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A chat message as delivered to clients.
///
/// Immutable once built: the relay never edits a message after it was received
/// from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub username: String,
    pub content: String,
    #[serde(rename = "creationDate")]
    pub creation_date: DateTime<Utc>,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(username: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            content: content.into(),
            creation_date: Utc::now(),
        }
    }
}

/// A message a session forwards to the chat backend.
///
/// The username always comes from the authenticated session, never from the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub username: String,
    pub content: String,
}

/// What a client sends. Only `content` is read; `username` and `creationDate`
/// are tolerated and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub content: String,
}

/// Error codes carried in an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The frame was not a JSON object with a string `content`.
    InvalidFrame,
    /// The frame exceeded the inbound frame ceiling.
    FrameTooLarge,
    /// Content was empty after sanitization.
    EmptyContent,
    /// Content exceeded the content ceiling after sanitization.
    ContentTooLong,
    /// The user already has a live session and duplicates are rejected.
    SessionAlreadyOpen,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidFrame => "INVALID_FRAME",
            Self::FrameTooLarge => "FRAME_TOO_LARGE",
            Self::EmptyContent => "EMPTY_CONTENT",
            Self::ContentTooLong => "CONTENT_TOO_LONG",
            Self::SessionAlreadyOpen => "SESSION_ALREADY_OPEN",
        }
    }

    /// Whether the session keeps reading after reporting this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidFrame | Self::SessionAlreadyOpen)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error envelope: `{"error": "<CODE>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: ErrorCode,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Serialize a message into a text frame.
pub fn encode_message(message: &Message) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(CodecError::Encode)
}

/// Parse a full message frame, as produced by [`encode_message`].
pub fn decode_message(frame: &str) -> Result<Message, CodecError> {
    serde_json::from_str(frame).map_err(CodecError::Decode)
}

/// Parse a client frame.
pub fn decode_inbound(frame: &str) -> Result<InboundFrame, CodecError> {
    serde_json::from_str(frame).map_err(CodecError::Decode)
}

/// Serialize an error frame.
pub fn encode_error(code: ErrorCode) -> String {
    // A unit enum inside a one-field struct cannot fail to serialize.
    format!(r#"{{"error":"{}"}}"#, code.as_str())
}

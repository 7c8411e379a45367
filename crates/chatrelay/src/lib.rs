//! Chat relay library.
//!
//! Bridges authenticated WebSocket clients to a chat backend's bidirectional
//! message stream. See [`ws`] for the session model.

pub mod api;
pub mod auth;
pub mod backend;
pub mod config;
pub mod ws;

pub use chatrelay_protocol as protocol;

//! HTTP surface: the chat WebSocket endpoint and a health check.

mod error;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;

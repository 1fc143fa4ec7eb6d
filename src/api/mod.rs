//! API layer for the relay.
//!
//! This module contains the HTTP handlers for every client protocol, caller
//! authentication and the streaming bridge that carries frames across
//! credential failovers.

pub mod auth;
pub mod bridge;
pub mod disconnect;
pub mod handlers;

// Re-export commonly used types
pub use auth::KeyStore;
pub use bridge::{Relay, RelayRequest};
pub use disconnect::DisconnectStream;
pub use handlers::{router, AppState};

//! svakla Protocol
//!
//! Shared types for the svakla chat server.
//! `ServerFrame` is serialized as JSON over WebSocket; `ChatMessage` is the
//! record persisted by the chat store.

pub mod server;
pub mod types;

pub use server::ServerFrame;
pub use types::*;

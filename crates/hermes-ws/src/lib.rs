//! WebSocket connection primitive and client registry for Hermes.
//!
//! This crate owns everything that touches a single WebSocket: validating
//! the HTTP upgrade, wrapping the upgraded stream, and exposing a shared
//! send handle. It also provides the [`ClientRegistry`], the one piece of
//! shared mutable state the server keeps.
//!
//! # Architecture
//!
//! ```text
//! HTTP Request ──► prepare_upgrade() ──► 101 Switching Protocols
//!                                               │
//!                                               ▼
//!                      complete_upgrade() ──► WebSocket (receive half)
//!                                               │
//!                                               ├── sender() ──► WebSocketSender
//!                                               │                   │
//!                                               ▼                   ▼
//!                                        receive loop        ClientRegistry
//!                                                          (Arc<dyn ClientConnection>)
//! ```
//!
//! Fragmented messages are reassembled by `tungstenite` up to
//! [`WebSocketConfig::max_message_size`]; pings are answered by the protocol
//! layer before they surface.

pub mod config;
pub mod connection;
pub mod error;
pub mod memory;
pub mod message;
pub mod registry;
pub mod upgrade;

pub use config::{RegistryConfig, WebSocketConfig};
pub use connection::{ClientConnection, ClientId, ConnectionState, WebSocket, WebSocketSender};
pub use error::{CloseCode, WsError, WsResult};
pub use memory::MemoryConnection;
pub use message::{CloseFrame, Message};
pub use registry::{ClientRegistry, RegisteredClient, RegistryStats};
pub use upgrade::{
    compute_accept_key, complete_upgrade, is_websocket_request, prepare_upgrade, text_response,
    validate_upgrade_request, WebSocketUpgrade,
};

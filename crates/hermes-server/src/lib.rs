//! WebSocket server core for Hermes.
//!
//! Accepts WebSocket upgrades on one listener prefix, keeps every live
//! connection in a [`ClientRegistry`](hermes_ws::ClientRegistry), runs one
//! receive loop per connection and reports what happens through an
//! [`EventBus`].
//!
//! # Architecture
//!
//! ```text
//! TcpListener ──► accept loop ──► serve_http (hyper, HTTP/1.1)
//!                                     │ 101 Switching Protocols
//!                                     ▼
//!                             handle_connection (one task per client)
//!                                     │ put ──► ClientRegistry ◄── send_to_client / broadcast
//!                                     ▼
//!                               receive_loop ──► EventBus ──► listeners
//!                                     │
//!                                     ▼
//!                         close if open, remove, ClientDisconnected
//! ```
//!
//! [`WebSocketServer::stop`] closes every registered client with a normal
//! closure, clears the registry, stops the accept loop and waits (bounded by
//! the shutdown timeout) for the connection tasks to finish.

pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod receive;
pub mod server;
pub mod shutdown;

pub use config::{ListenerPrefix, Scheme, ServerConfig, ServerConfigBuilder, DEFAULT_PREFIX};
pub use error::ServerError;
pub use events::{EventBus, EventKind, EventListener, ListenerId, ServerEvent};
pub use receive::{receive_loop, LoopExit};
pub use server::{BroadcastReport, ServerLifecycleState, WebSocketServer};
pub use shutdown::{ConnectionTracker, ShutdownSignal};

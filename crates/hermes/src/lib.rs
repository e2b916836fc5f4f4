//! # Hermes
//!
//! A WebSocket server that keeps a registry of connected clients, reports
//! their lifecycle and messages as events, and can message one client or
//! broadcast to all of them.
//!
//! ```rust,ignore
//! use hermes::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ServerError> {
//!     let server = WebSocketServer::new(ServerConfig::from_prefix("http://+:20005/")?);
//!     server.events().subscribe(|event: &ServerEvent| println!("{event}"));
//!     server.start().await?;
//!     server.broadcast("hello").await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Crates
//!
//! ```text
//! hermes-ws         connection primitive, upgrade, client registry
//! hermes-server     accept loop, receive loop, event bus, outbound API
//! hermes-telemetry  logging and Prometheus metrics
//! hermes-config     layered TOML/JSON/env configuration
//! hermes-certs      HTTP.sys certificate binding (Windows)
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Re-export the connection layer
pub use hermes_ws as ws;

// Re-export the server core
pub use hermes_server as server;

// Re-export telemetry
pub use hermes_telemetry as telemetry;

// Re-export configuration
pub use hermes_config as config;

// Re-export certificate binding
pub use hermes_certs as certs;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use hermes_server::{
        BroadcastReport, EventBus, EventKind, EventListener, ListenerId, ListenerPrefix,
        ServerConfig, ServerError, ServerEvent, ServerLifecycleState, ShutdownSignal,
        WebSocketServer,
    };

    pub use hermes_ws::{ClientId, CloseCode, Message, WebSocketConfig, WsError, WsResult};

    pub use hermes_config::{ConfigError, ConfigLoader, HermesConfig};

    pub use hermes_telemetry::{init_telemetry, TelemetryConfig};
}

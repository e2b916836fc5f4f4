//! Typed, layered configuration for Hermes.
//!
//! Defaults, then a TOML or JSON file, then `HERMES__SECTION__KEY`
//! environment variables. Every section rejects unknown fields.
//!
//! ```toml
//! [server]
//! prefix = "http://+:20005/"
//! shutdown_timeout_secs = 30
//! max_connections = 1000
//!
//! [websocket]
//! max_message_size = 65536
//!
//! [telemetry.logging]
//! level = "info"
//! format = "json"
//!
//! [telemetry.metrics]
//! enabled = true
//! addr = "0.0.0.0:9090"
//!
//! [certificate]
//! pfx_path = "C:\\certs\\server.pfx"
//! passphrase = "secret"
//! cert_hash = "0123456789abcdef0123456789abcdef01234567"
//! app_id = "6f1c9b2e-3a4d-4e5f-8a9b-0c1d2e3f4a5b"
//! ```
//!
//! Environment examples:
//!
//! - `HERMES__SERVER__PREFIX=http://+:9000/`
//! - `HERMES__SERVER__MAX_CONNECTIONS=none`
//! - `HERMES__TELEMETRY__LOGGING__FORMAT=pretty`

#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::HermesConfig;
pub use error::ConfigError;
pub use loader::{ConfigLoader, DEFAULT_ENV_PREFIX};
pub use schema::*;

//! Configuration schema types.
//!
//! Every section rejects unknown fields and fills missing ones with the
//! defaults below.

use hermes_server::config::{DEFAULT_PREFIX, DEFAULT_SHUTDOWN_TIMEOUT_SECS};
use hermes_telemetry::metrics::DEFAULT_METRICS_ADDR;
use hermes_ws::config::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_WRITE_BUFFER_SIZE};
use serde::{Deserialize, Serialize};

/// `[server]`: where to listen and how to stop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Listener prefix, e.g. `"http://+:20005/"`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Upper bound on a graceful stop, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum registered clients. Absent means unlimited.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_connections: None,
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

/// `[websocket]`: protocol limits per connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WebSocketSection {
    /// Largest reassembled message, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Largest single frame, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Outgoing buffer size, in bytes.
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_frame_size: default_max_frame_size(),
            write_buffer_size: default_write_buffer_size(),
        }
    }
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_write_buffer_size() -> usize {
    DEFAULT_WRITE_BUFFER_SIZE
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

/// `[telemetry.logging]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// Enable logging.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Level or filter directive (e.g. "info", "hermes_server=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Colour pretty output.
    #[serde(default)]
    pub ansi_enabled: bool,

    /// Include file and line in each event.
    #[serde(default)]
    pub include_location: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::default(),
            ansi_enabled: false,
            include_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// `[telemetry.metrics]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MetricsSection {
    /// Serve a Prometheus scrape endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Scrape endpoint address.
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    DEFAULT_METRICS_ADDR.to_string()
}

/// `[telemetry]`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingSection,

    /// Metrics settings.
    #[serde(default)]
    pub metrics: MetricsSection,
}

/// `[certificate]`: a PFX bundle bound through HTTP.sys before start.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CertificateSection {
    /// Path to the `.pfx` file.
    pub pfx_path: String,

    /// PFX passphrase.
    #[serde(default)]
    pub passphrase: String,

    /// SHA-1 thumbprint, 40 hex digits.
    pub cert_hash: String,

    /// Application GUID recorded with the binding.
    pub app_id: String,

    /// Prefix whose `ip:port` gets the certificate. Defaults to the host
    /// and port of `server.prefix`.
    #[serde(default)]
    pub binding: Option<String>,
}

impl std::fmt::Debug for CertificateSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSection")
            .field("pfx_path", &self.pfx_path)
            .field("passphrase", &"<redacted>")
            .field("cert_hash", &self.cert_hash)
            .field("app_id", &self.app_id)
            .field("binding", &self.binding)
            .finish()
    }
}

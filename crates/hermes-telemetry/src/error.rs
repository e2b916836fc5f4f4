//! Telemetry error types.

use thiserror::Error;

/// Errors raised while installing the log subscriber or metrics exporter.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The Prometheus exporter could not be installed.
    #[error("Failed to initialize metrics: {0}")]
    MetricsInit(String),

    /// Bad level directive, or a global subscriber is already set.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// The scrape address is not a socket address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

//! Prometheus metrics for Hermes.
//!
//! Recording functions are no-ops until [`init_metrics`] installs a
//! recorder, so the server core calls them unconditionally.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `hermes_ws_connections_active` | Gauge | - | Registered connections |
//! | `hermes_ws_connections_total` | Counter | - | Connections ever registered |
//! | `hermes_ws_disconnects_total` | Counter | `cause` | Receive loop exits by cause |
//! | `hermes_ws_messages_received_total` | Counter | - | Inbound data messages |
//! | `hermes_ws_messages_sent_total` | Counter | `outcome` | Outbound sends |
//! | `hermes_ws_upgrades_rejected_total` | Counter | `reason` | Refused upgrades |

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Default address of the Prometheus scrape endpoint.
pub const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:9090";

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Address to expose metrics on.
    pub addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: DEFAULT_METRICS_ADDR.to_string(),
        }
    }
}

/// Initializes the metrics subsystem.
///
/// Installs a Prometheus recorder with an HTTP scrape listener on
/// `config.addr`. Must be called from within a tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .addr
        .parse()
        .map_err(|e| TelemetryError::InvalidAddress(format!("{}: {e}", config.addr)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    register_metric_descriptions();

    Ok(())
}

fn register_metric_descriptions() {
    describe_gauge!(
        "hermes_ws_connections_active",
        "Number of WebSocket connections currently registered"
    );
    describe_counter!(
        "hermes_ws_connections_total",
        "Total number of WebSocket connections registered"
    );
    describe_counter!(
        "hermes_ws_disconnects_total",
        "Total number of receive loop exits by cause"
    );
    describe_counter!(
        "hermes_ws_messages_received_total",
        "Total number of data messages received from clients"
    );
    describe_counter!(
        "hermes_ws_messages_sent_total",
        "Total number of messages sent to clients by outcome"
    );
    describe_counter!(
        "hermes_ws_upgrades_rejected_total",
        "Total number of refused upgrade requests by reason"
    );
}

/// Records a receive loop exit.
pub fn record_disconnect(cause: &'static str) {
    counter!("hermes_ws_disconnects_total", "cause" => cause).increment(1);
}

/// Records an inbound data message.
pub fn record_message_received() {
    counter!("hermes_ws_messages_received_total").increment(1);
}

/// Records an outbound send attempt.
pub fn record_message_sent(delivered: bool) {
    let outcome = if delivered { "delivered" } else { "failed" };
    counter!("hermes_ws_messages_sent_total", "outcome" => outcome).increment(1);
}

/// Records a refused upgrade request.
pub fn record_upgrade_rejected(reason: &'static str) {
    counter!("hermes_ws_upgrades_rejected_total", "reason" => reason).increment(1);
}

/// Guard that keeps `hermes_ws_connections_active` in step with the registry.
///
/// Create it right after a connection is registered; dropping it decrements
/// the gauge even if the connection task unwinds.
#[derive(Debug)]
pub struct ConnectionGuard {
    _private: (),
}

impl ConnectionGuard {
    /// Creates a new guard and records the connection.
    #[must_use]
    pub fn new() -> Self {
        counter!("hermes_ws_connections_total").increment(1);
        gauge!("hermes_ws_connections_active").increment(1.0);
        Self { _private: () }
    }
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        gauge!("hermes_ws_connections_active").decrement(1.0);
    }
}

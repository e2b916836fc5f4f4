//! The root configuration type and its conversions.

use std::path::PathBuf;
use std::time::Duration;

use hermes_certs::CertificateBundle;
use hermes_server::{ListenerPrefix, ServerConfig};
use hermes_telemetry::logging::create_env_filter;
use hermes_telemetry::{LogConfig, MetricsConfig, TelemetryConfig};
use hermes_ws::WebSocketConfig;
use serde::{Deserialize, Serialize};

use crate::{
    CertificateSection, ConfigError, LogFormat, ServerSection, TelemetrySection, WebSocketSection,
};

/// Complete Hermes configuration.
///
/// Use [`ConfigLoader`](crate::ConfigLoader) to layer files and environment
/// variables over the defaults.
///
/// ```
/// use hermes_config::HermesConfig;
///
/// let config = HermesConfig::default();
/// assert_eq!(config.server.prefix, "http://localhost:20005/");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HermesConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Protocol limits.
    #[serde(default)]
    pub websocket: WebSocketSection,

    /// Logging and metrics.
    #[serde(default)]
    pub telemetry: TelemetrySection,

    /// Certificate to bind before starting. Absent means none.
    #[serde(default)]
    pub certificate: Option<CertificateSection>,
}

impl HermesConfig {
    /// Check every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ListenerPrefix::parse(&self.server.prefix)
            .map_err(|e| ConfigError::invalid_value("server.prefix", e.to_string()))?;

        if self.server.max_connections == Some(0) {
            return Err(ConfigError::invalid_value(
                "server.max_connections",
                "must be greater than zero; omit it for no limit",
            ));
        }

        for (field, value) in [
            ("websocket.max_message_size", self.websocket.max_message_size),
            ("websocket.max_frame_size", self.websocket.max_frame_size),
            ("websocket.write_buffer_size", self.websocket.write_buffer_size),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid_value(field, "must be greater than zero"));
            }
        }

        if self.websocket.max_frame_size > self.websocket.max_message_size {
            return Err(ConfigError::invalid_value(
                "websocket.max_frame_size",
                "must not exceed websocket.max_message_size",
            ));
        }

        let logging = &self.telemetry.logging;
        if logging.enabled {
            create_env_filter(&logging.level)
                .map_err(|e| ConfigError::invalid_value("telemetry.logging.level", e.to_string()))?;
        }

        let metrics = &self.telemetry.metrics;
        if metrics.enabled && metrics.addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "telemetry.metrics.addr",
                format!("invalid socket address: {}", metrics.addr),
            ));
        }

        if let Some(bundle) = self.certificate_bundle() {
            bundle
                .validate()
                .map_err(|e| ConfigError::invalid_value("certificate", e.to_string()))?;
        }

        Ok(())
    }

    /// Preset for local development: pretty, coloured debug logs.
    ///
    /// ```
    /// use hermes_config::{HermesConfig, LogFormat};
    ///
    /// let config = HermesConfig::development();
    /// assert_eq!(config.telemetry.logging.format, LogFormat::Pretty);
    /// ```
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();
        config.telemetry.logging.level = "debug".to_string();
        config.telemetry.logging.format = LogFormat::Pretty;
        config.telemetry.logging.ansi_enabled = true;
        config.telemetry.logging.include_location = true;
        config
    }

    /// Preset for production: JSON info logs and metrics on.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();
        config.telemetry.logging.level = "info".to_string();
        config.telemetry.logging.format = LogFormat::Json;
        config.telemetry.logging.ansi_enabled = false;
        config.telemetry.metrics.enabled = true;
        config
    }

    /// Build the server configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the prefix does not parse.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let prefix = ListenerPrefix::parse(&self.server.prefix)
            .map_err(|e| ConfigError::invalid_value("server.prefix", e.to_string()))?;

        let websocket = WebSocketConfig::new()
            .max_message_size(self.websocket.max_message_size)
            .max_frame_size(self.websocket.max_frame_size)
            .write_buffer_size(self.websocket.write_buffer_size);

        Ok(ServerConfig::builder()
            .prefix(prefix)
            .shutdown_timeout(Duration::from_secs(self.server.shutdown_timeout_secs))
            .max_connections(self.server.max_connections)
            .websocket(websocket)
            .build())
    }

    /// Build the telemetry configuration.
    #[must_use]
    pub fn to_telemetry_config(&self) -> TelemetryConfig {
        let logging = &self.telemetry.logging;
        TelemetryConfig {
            logging: LogConfig {
                enabled: logging.enabled,
                level: logging.level.clone(),
                json_format: logging.format == LogFormat::Json,
                file_line_info: logging.include_location,
                thread_ids: false,
                include_target: true,
                ansi: logging.ansi_enabled,
            },
            metrics: MetricsConfig {
                enabled: self.telemetry.metrics.enabled,
                addr: self.telemetry.metrics.addr.clone(),
            },
        }
    }

    /// The certificate to install, if a `[certificate]` section is present.
    ///
    /// The binding falls back to `server.prefix`.
    #[must_use]
    pub fn certificate_bundle(&self) -> Option<CertificateBundle> {
        self.certificate.as_ref().map(|cert| CertificateBundle {
            pfx_path: PathBuf::from(&cert.pfx_path),
            passphrase: cert.passphrase.clone(),
            binding: cert
                .binding
                .clone()
                .unwrap_or_else(|| self.server.prefix.clone()),
            cert_hash: cert.cert_hash.clone(),
            app_id: cert.app_id.clone(),
        })
    }
}

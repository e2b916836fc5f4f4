//! Server configuration types.
//!
//! A server listens on a single prefix of the form
//! `scheme://host:port/path/`. The prefix decides the bind address and which
//! request paths are served; everything else is tuned through
//! [`ServerConfig::builder()`].
//!
//! # Example
//!
//! ```rust
//! use hermes_server::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::from_prefix("http://localhost:20005/")
//!     .unwrap()
//!     .to_builder()
//!     .shutdown_timeout(Duration::from_secs(5))
//!     .build();
//!
//! assert_eq!(config.prefix().port(), 20005);
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use hermes_ws::{RegistryConfig, WebSocketConfig};

use crate::error::ServerError;

/// Default listener prefix.
pub const DEFAULT_PREFIX: &str = "http://localhost:20005/";

/// Default port of [`DEFAULT_PREFIX`].
pub const DEFAULT_PORT: u16 = 20005;

/// Port used when a prefix names none.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Scheme of a listener prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `http://`
    Http,
    /// `ws://`
    Ws,
}

impl Scheme {
    /// The scheme as written in a prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Ws => "ws",
        }
    }
}

/// A parsed listener prefix.
///
/// Hosts `+` and `*` bind every interface and `localhost` binds the IPv4
/// loopback address. Other hosts must be IP literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerPrefix {
    scheme: Scheme,
    host: String,
    ip: IpAddr,
    port: u16,
    path: String,
}

impl ListenerPrefix {
    /// Parse a prefix such as `http://+:20005/` or `ws://127.0.0.1:0/chat/`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnsupportedScheme`] for `https` and `wss`, and
    /// [`ServerError::InvalidPrefix`] for anything else that is malformed.
    pub fn parse(prefix: &str) -> Result<Self, ServerError> {
        let (scheme, rest) = prefix
            .split_once("://")
            .ok_or_else(|| ServerError::invalid_prefix(prefix, "missing '://'"))?;

        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "ws" => Scheme::Ws,
            "https" | "wss" => {
                return Err(ServerError::UnsupportedScheme {
                    scheme: scheme.to_ascii_lowercase(),
                })
            }
            other => {
                return Err(ServerError::invalid_prefix(
                    prefix,
                    format!("unknown scheme '{other}'"),
                ))
            }
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = split_host_port(authority)
            .ok_or_else(|| ServerError::invalid_prefix(prefix, "malformed host or port"))?;

        if host.is_empty() {
            return Err(ServerError::invalid_prefix(prefix, "missing host"));
        }

        let ip = resolve_host(host).ok_or_else(|| {
            ServerError::invalid_prefix(
                prefix,
                format!("host '{host}' must be an IP address, 'localhost', '+' or '*'"),
            )
        })?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            ip,
            port: port.unwrap_or(DEFAULT_HTTP_PORT),
            path: path.to_string(),
        })
    }

    /// The prefix scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The host as written.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port (80 when the prefix names none).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The path prefix, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The socket address to bind.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Check whether a request path falls under this prefix.
    ///
    /// `/chat/` matches `/chat`, `/chat/` and `/chat/room`, but not `/chatter`.
    pub fn matches_path(&self, request_path: &str) -> bool {
        let base = self.path.trim_end_matches('/');
        if base.is_empty() {
            return true;
        }
        match request_path.strip_prefix(base) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl Default for ListenerPrefix {
    fn default() -> Self {
        Self {
            scheme: Scheme::Http,
            host: "localhost".to_string(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            path: "/".to_string(),
        }
    }
}

impl FromStr for ListenerPrefix {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ListenerPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme.as_str())?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        write!(f, ":{}{}", self.port, self.path)
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
///
/// Returns `None` when the port is present but not a valid `u16`.
fn split_host_port(authority: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        return match after {
            "" => Some((host, None)),
            _ => {
                let port = after.strip_prefix(':')?;
                Some((host, Some(port.parse().ok()?)))
            }
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((authority, None)),
    }
}

fn resolve_host(host: &str) -> Option<IpAddr> {
    match host {
        "+" | "*" => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        h if h.eq_ignore_ascii_case("localhost") => Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        h => h.parse().ok(),
    }
}

/// Server configuration.
///
/// Use [`ServerConfig::builder()`] or [`ServerConfig::from_prefix`] to
/// construct instances.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where to listen.
    prefix: ListenerPrefix,

    /// How long `stop` waits for connection tasks to finish.
    shutdown_timeout: Duration,

    /// Maximum registered connections (None = unlimited).
    max_connections: Option<usize>,

    /// Protocol limits applied to every upgraded connection.
    websocket: WebSocketConfig,
}

impl ServerConfig {
    /// Creates a new server configuration builder.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Default configuration listening on `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix cannot be parsed.
    pub fn from_prefix(prefix: &str) -> Result<Self, ServerError> {
        Ok(Self::builder().prefix(ListenerPrefix::parse(prefix)?).build())
    }

    /// Returns a builder seeded with this configuration.
    #[must_use]
    pub fn to_builder(&self) -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: self.clone(),
        }
    }

    /// Returns the listener prefix.
    #[must_use]
    pub fn prefix(&self) -> &ListenerPrefix {
        &self.prefix
    }

    /// Returns the graceful shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Returns the connection limit, if any.
    #[must_use]
    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    /// Returns the per-connection protocol limits.
    #[must_use]
    pub fn websocket(&self) -> &WebSocketConfig {
        &self.websocket
    }

    /// Registry settings derived from this configuration.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_connections: self.max_connections,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            prefix: ListenerPrefix::default(),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            max_connections: None,
            websocket: WebSocketConfig::default(),
        }
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Creates a builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listener prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: ListenerPrefix) -> Self {
        self.config.prefix = prefix;
        self
    }

    /// Sets how long `stop` waits for connection tasks.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Sets the maximum number of registered connections.
    #[must_use]
    pub fn max_connections(mut self, max: Option<usize>) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Sets the per-connection protocol limits.
    #[must_use]
    pub fn websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.config.websocket = websocket;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

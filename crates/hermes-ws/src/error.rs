//! Error types for WebSocket operations.
//!
//! Covers handshake validation, per-connection transport failures and the
//! contract errors raised by the [`ClientRegistry`](crate::ClientRegistry).

use std::fmt;
use std::io;

use thiserror::Error;
use tungstenite::error::ProtocolError;

use crate::connection::ClientId;

/// Result type for WebSocket operations.
pub type WsResult<T> = Result<T, WsError>;

/// Errors that can occur during WebSocket operations.
#[derive(Debug, Error)]
pub enum WsError {
    /// The HTTP request was not a valid WebSocket upgrade request.
    #[error("not a WebSocket upgrade request: {reason}")]
    NotWebSocketRequest {
        /// Reason why the request is not a valid WebSocket upgrade.
        reason: String,
    },

    /// The WebSocket handshake failed.
    #[error("WebSocket handshake failed: {0}")]
    HandshakeFailed(String),

    /// The WebSocket connection was closed.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Optional close code.
        code: Option<u16>,
        /// Reason for closing.
        reason: String,
    },

    /// Failed to send a message.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// Failed to receive a message.
    #[error("failed to receive message: {0}")]
    ReceiveFailed(String),

    /// No open connection is registered under the given id.
    #[error("client not connected: {client_id}")]
    NotConnected {
        /// The id that was looked up.
        client_id: ClientId,
    },

    /// A connection is already registered under the given id.
    #[error("duplicate client id: {client_id}")]
    DuplicateId {
        /// The id that was already present.
        client_id: ClientId,
    },

    /// The registry holds its configured maximum number of connections.
    #[error("connection limit reached ({limit})")]
    CapacityReached {
        /// The configured limit.
        limit: usize,
    },

    /// The registry has been closed by a server shutdown.
    #[error("client registry is closed")]
    RegistryClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Tungstenite error.
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tungstenite::Error),
}

impl WsError {
    /// Create a new "not a WebSocket request" error.
    pub fn not_websocket(reason: impl Into<String>) -> Self {
        Self::NotWebSocketRequest {
            reason: reason.into(),
        }
    }

    /// Create a new handshake failed error.
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed(reason.into())
    }

    /// Create a new connection closed error.
    pub fn connection_closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }

    /// Create a new send failed error.
    pub fn send_failed(reason: impl Into<String>) -> Self {
        Self::SendFailed(reason.into())
    }

    /// Create a new receive failed error.
    pub fn receive_failed(reason: impl Into<String>) -> Self {
        Self::ReceiveFailed(reason.into())
    }

    /// Create a new not connected error.
    pub fn not_connected(client_id: ClientId) -> Self {
        Self::NotConnected { client_id }
    }

    /// Get the close code if this is a connection closed error.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::ConnectionClosed { code, .. } => *code,
            _ => None,
        }
    }

    /// Check whether this error means the peer went away without a clean
    /// closing handshake.
    ///
    /// These are logged as ordinary disconnects rather than failures.
    pub fn is_premature_termination(&self) -> bool {
        match self {
            Self::ConnectionClosed { .. } => true,
            Self::Io(err) => is_disconnect_kind(err.kind()),
            Self::Tungstenite(err) => match err {
                tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                    true
                }
                tungstenite::Error::Io(io_err) => is_disconnect_kind(io_err.kind()),
                _ => false,
            },
            _ => false,
        }
    }
}

fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Close code for WebSocket connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    Protocol = 1002,
    /// Unsupported data (1003).
    Unsupported = 1003,
    /// No status received (1005).
    NoStatus = 1005,
    /// Abnormal closure (1006).
    Abnormal = 1006,
    /// Invalid payload data (1007).
    InvalidPayload = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    MessageTooBig = 1009,
    /// Extension required (1010).
    ExtensionRequired = 1010,
    /// Internal error (1011).
    InternalError = 1011,
    /// Service restart (1012).
    ServiceRestart = 1012,
    /// Try again later (1013).
    TryAgainLater = 1013,
    /// Bad gateway (1014).
    BadGateway = 1014,
    /// TLS handshake failure (1015).
    TlsHandshake = 1015,
}

impl CloseCode {
    /// Convert from a u16 code.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::Protocol),
            1003 => Some(Self::Unsupported),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooBig),
            1010 => Some(Self::ExtensionRequired),
            1011 => Some(Self::InternalError),
            1012 => Some(Self::ServiceRestart),
            1013 => Some(Self::TryAgainLater),
            1014 => Some(Self::BadGateway),
            1015 => Some(Self::TlsHandshake),
            _ => None,
        }
    }

    /// Get the u16 value of this close code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether this code signals a close initiated without error.
    pub fn is_normal(self) -> bool {
        matches!(self, Self::Normal | Self::GoingAway)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "Normal",
            Self::GoingAway => "GoingAway",
            Self::Protocol => "Protocol",
            Self::Unsupported => "Unsupported",
            Self::NoStatus => "NoStatus",
            Self::Abnormal => "Abnormal",
            Self::InvalidPayload => "InvalidPayload",
            Self::PolicyViolation => "PolicyViolation",
            Self::MessageTooBig => "MessageTooBig",
            Self::ExtensionRequired => "ExtensionRequired",
            Self::InternalError => "InternalError",
            Self::ServiceRestart => "ServiceRestart",
            Self::TryAgainLater => "TryAgainLater",
            Self::BadGateway => "BadGateway",
            Self::TlsHandshake => "TlsHandshake",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}

//! Server error types.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while configuring, starting or running the server.
///
/// Per-connection failures never surface here: they are logged by the
/// connection handler and end only that connection.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener prefix could not be parsed.
    #[error("Invalid listener prefix '{prefix}': {reason}")]
    InvalidPrefix {
        /// The prefix as given.
        prefix: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The prefix names a scheme the listener cannot serve directly.
    #[error("Unsupported scheme '{scheme}': only http and ws prefixes can be bound")]
    UnsupportedScheme {
        /// The rejected scheme.
        scheme: String,
    },

    /// Failed to bind the listener.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// `start` was called on a server that is already listening.
    #[error("Server is already started")]
    AlreadyStarted,

    /// `start` was called on a server that has been stopped.
    #[error("Server has been stopped and cannot be restarted")]
    AlreadyStopped,

    /// I/O error during server operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Create an invalid prefix error.
    pub fn invalid_prefix(prefix: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPrefix {
            prefix: prefix.into(),
            reason: reason.into(),
        }
    }

    /// Check whether this is a lifecycle misuse rather than an I/O failure.
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(self, Self::AlreadyStarted | Self::AlreadyStopped)
    }
}

//! WebSocket configuration.
//!
//! Protocol limits applied to each upgraded connection, and the capacity
//! settings of the client registry.

use tungstenite::protocol::WebSocketConfig as ProtocolConfig;

/// Default maximum size of a reassembled message (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default maximum size of a single frame (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default write buffer size (128 KiB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 128 * 1024;

/// Configuration for a WebSocket connection.
///
/// Fragmented messages are reassembled by the protocol layer up to
/// `max_message_size`. A larger message fails the receive with a capacity
/// error and the peer is closed with `MessageTooBig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Maximum reassembled message size in bytes.
    pub max_message_size: usize,
    /// Maximum frame size in bytes.
    pub max_frame_size: usize,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Whether to accept unmasked frames from clients (default: false).
    pub accept_unmasked_frames: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            accept_unmasked_frames: false,
        }
    }
}

impl WebSocketConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the maximum frame size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the write buffer size.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set whether to accept unmasked frames from clients.
    pub fn accept_unmasked_frames(mut self, accept: bool) -> Self {
        self.accept_unmasked_frames = accept;
        self
    }

    /// Translate into the protocol layer's configuration.
    pub fn to_protocol_config(&self) -> ProtocolConfig {
        let mut config = ProtocolConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_frame_size.min(self.max_message_size));
        config.write_buffer_size = self.write_buffer_size;
        config.max_write_buffer_size = config
            .max_write_buffer_size
            .max(self.write_buffer_size.saturating_mul(2));
        config.accept_unmasked_frames = self.accept_unmasked_frames;
        config
    }
}

/// Configuration for the client registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Maximum simultaneous connections; `None` means unlimited.
    pub max_connections: Option<usize>,
}

impl RegistryConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of simultaneous connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024);
        assert_eq!(config.max_frame_size, 64 * 1024);
        assert!(!config.accept_unmasked_frames);
    }

    #[test]
    fn test_websocket_config_builder() {
        let config = WebSocketConfig::new()
            .max_message_size(1024)
            .max_frame_size(512)
            .accept_unmasked_frames(true);

        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.max_frame_size, 512);
        assert!(config.accept_unmasked_frames);
    }

    #[test]
    fn test_protocol_config_limits() {
        let config = WebSocketConfig::new()
            .max_message_size(2048)
            .max_frame_size(4096)
            .to_protocol_config();

        assert_eq!(config.max_message_size, Some(2048));
        // Frames never exceed the message bound.
        assert_eq!(config.max_frame_size, Some(2048));
        assert!(config.max_write_buffer_size >= config.write_buffer_size);
    }

    #[test]
    fn test_registry_config() {
        assert_eq!(RegistryConfig::default().max_connections, None);
        assert_eq!(RegistryConfig::new().max_connections(8).max_connections, Some(8));
    }
}

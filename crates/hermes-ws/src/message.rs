//! WebSocket message types.
//!
//! A thin owned mirror of the `tungstenite` message model so the rest of the
//! workspace never names `tungstenite` types directly.

use std::borrow::Cow;

use crate::error::CloseCode;

/// A WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message (UTF-8 encoded).
    Text(String),
    /// A binary message.
    Binary(Vec<u8>),
    /// A ping frame with optional payload.
    Ping(Vec<u8>),
    /// A pong frame with optional payload.
    Pong(Vec<u8>),
    /// A close frame with optional code and reason.
    Close(Option<CloseFrame>),
}

impl Message {
    /// Create a new text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Create a new binary message.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::Binary(data.into())
    }

    /// Create a close message with a code and reason.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseFrame::new(code, reason)))
    }

    /// Check if this is a close message.
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    /// Check if this is a data message (text or binary).
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Binary(_))
    }

    /// Get the message payload as text.
    ///
    /// Returns `None` if this is not a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Decode a data message into text.
    ///
    /// Text frames are returned as-is. Binary frames are decoded over exactly
    /// their payload, with invalid sequences replaced by U+FFFD. Control
    /// frames yield `None`.
    pub fn into_text_lossy(self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(b) => Some(match String::from_utf8(b) {
                Ok(s) => s,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            }),
            _ => None,
        }
    }

    /// Get the close frame if this is a close message.
    pub fn close_frame(&self) -> Option<&CloseFrame> {
        match self {
            Self::Close(frame) => frame.as_ref(),
            _ => None,
        }
    }

    /// Short name of the frame kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Close(_) => "close",
        }
    }

    /// Get the length of the message payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => b.len(),
            Self::Close(Some(frame)) => 2 + frame.reason.len(),
            Self::Close(None) => 0,
        }
    }

    /// Check if the message payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<tungstenite::Message> for Message {
    fn from(msg: tungstenite::Message) -> Self {
        match msg {
            tungstenite::Message::Text(s) => Self::Text(s.as_str().to_owned()),
            tungstenite::Message::Binary(b) => Self::Binary(b.to_vec()),
            tungstenite::Message::Ping(b) => Self::Ping(b.to_vec()),
            tungstenite::Message::Pong(b) => Self::Pong(b.to_vec()),
            tungstenite::Message::Close(frame) => Self::Close(frame.map(CloseFrame::from)),
            // Raw frames are only produced when writing; a reader never sees one.
            tungstenite::Message::Frame(frame) => Self::Binary(frame.payload().to_vec()),
        }
    }
}

impl From<Message> for tungstenite::Message {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(s) => Self::Text(s.into()),
            Message::Binary(b) => Self::Binary(b.into()),
            Message::Ping(b) => Self::Ping(b.into()),
            Message::Pong(b) => Self::Pong(b.into()),
            Message::Close(frame) => {
                Self::Close(frame.map(tungstenite::protocol::CloseFrame::from))
            }
        }
    }
}

/// A WebSocket close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// The close code.
    pub code: u16,
    /// The close reason.
    pub reason: Cow<'static, str>,
}

impl CloseFrame {
    /// Create a new close frame.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            reason: Cow::Owned(reason.into()),
        }
    }

    /// Get the close code enum value if it's a standard code.
    pub fn close_code(&self) -> Option<CloseCode> {
        CloseCode::from_u16(self.code)
    }
}

impl From<tungstenite::protocol::CloseFrame> for CloseFrame {
    fn from(frame: tungstenite::protocol::CloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: Cow::Owned(frame.reason.as_str().to_owned()),
        }
    }
}

impl From<CloseFrame> for tungstenite::protocol::CloseFrame {
    fn from(frame: CloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: frame.reason.into_owned().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text() {
        let msg = Message::text("hello");
        assert!(msg.is_data());
        assert_eq!(msg.as_text(), Some("hello"));
        assert_eq!(msg.kind(), "text");
        assert_eq!(msg.len(), 5);
    }

    #[test]
    fn test_binary_decodes_exact_payload() {
        let msg = Message::binary(b"ping".to_vec());
        assert_eq!(msg.into_text_lossy(), Some("ping".to_string()));
    }

    #[test]
    fn test_binary_invalid_utf8_is_replaced() {
        let msg = Message::binary(vec![b'o', b'k', 0xFF]);
        assert_eq!(msg.into_text_lossy(), Some("ok\u{FFFD}".to_string()));
    }

    #[test]
    fn test_control_frames_have_no_text() {
        assert_eq!(Message::Ping(vec![1]).into_text_lossy(), None);
        assert_eq!(Message::Close(None).into_text_lossy(), None);
    }

    #[test]
    fn test_message_close() {
        let msg = Message::close(CloseCode::Normal, "goodbye");
        assert!(msg.is_close());
        let frame = msg.close_frame().unwrap();
        assert_eq!(frame.code, 1000);
        assert_eq!(frame.reason, "goodbye");
        assert_eq!(frame.close_code(), Some(CloseCode::Normal));
    }

    #[test]
    fn test_tungstenite_text_conversion() {
        let msg = Message::from(tungstenite::Message::text("pong"));
        assert_eq!(msg, Message::text("pong"));

        let back: tungstenite::Message = Message::text("pong").into();
        assert_eq!(back.to_text().unwrap(), "pong");
    }

    #[test]
    fn test_tungstenite_close_conversion() {
        let frame = CloseFrame::new(CloseCode::InternalError, "boom");
        let raw: tungstenite::protocol::CloseFrame = frame.clone().into();
        assert_eq!(u16::from(raw.code), 1011);
        assert_eq!(CloseFrame::from(raw), frame);
    }
}

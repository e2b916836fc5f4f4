//! WebSocket connection handles.
//!
//! An upgraded stream is split into a receive half ([`WebSocket`]) driven by
//! exactly one receive loop, and a cloneable send half ([`WebSocketSender`])
//! that the registry hands out to any number of concurrent senders. Both
//! halves observe one shared [`ConnectionState`].

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::WebSocketConfig;
use crate::error::{CloseCode, WsError, WsResult};
use crate::message::Message;

/// A process-unique identifier for a connected client.
///
/// Generated from 122 random bits at accept time and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Create a new random client ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a client ID from a UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ClientId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<ClientId> for Uuid {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

/// Lifecycle state of a connection as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Messages may be sent and received.
    Open = 0,
    /// A close frame has been sent or received; the handshake is in progress.
    Closing = 1,
    /// The transport is finished.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// State cell shared by both halves of a connection.
#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Open as u8)))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `Open` to `next`. Returns false if the state was not `Open`.
    fn leave_open(&self, next: ConnectionState) -> bool {
        self.0
            .compare_exchange(
                ConnectionState::Open as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Send-side operations on a registered connection.
///
/// This is the seam between the server core and the transport: the registry
/// stores `Arc<dyn ClientConnection>` so the core can be exercised against
/// in-memory fakes.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Send `text` as a single complete text message.
    ///
    /// Fails with [`WsError::ConnectionClosed`] when the connection is not open.
    async fn send_text(&self, text: &str) -> WsResult<()>;

    /// Close the connection.
    ///
    /// A no-op when the connection is already closed.
    async fn close(&self, code: CloseCode, reason: &str) -> WsResult<()>;

    /// Whether the connection is still open.
    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

type Sink<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, tungstenite::Message>>>;

/// The receive half of an upgraded WebSocket connection.
///
/// Yields inbound messages in arrival order. Pings are answered by the
/// protocol layer before they are yielded. After a close frame the state is
/// `Closing`; once the stream ends or fails the state is `Closed` and the
/// stream yields `None`.
pub struct WebSocket<S = tokio::net::TcpStream> {
    sender: Sink<S>,
    receiver: SplitStream<WebSocketStream<S>>,
    state: SharedState,
    config: WebSocketConfig,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new WebSocket from an underlying stream.
    pub fn new(stream: WebSocketStream<S>, config: WebSocketConfig) -> Self {
        let (sender, receiver) = stream.split();
        Self {
            sender: Arc::new(Mutex::new(sender)),
            receiver,
            state: SharedState::new(),
            config,
        }
    }

    /// Get the connection configuration.
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Get a handle that can be used to send messages from other tasks.
    pub fn sender(&self) -> WebSocketSender<S> {
        WebSocketSender {
            sender: Arc::clone(&self.sender),
            state: self.state.clone(),
        }
    }
}

impl<S> Stream for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = WsResult<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.state.get() == ConnectionState::Closed {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.receiver).poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => {
                let msg = Message::from(msg);
                if msg.is_close() && !self.state.leave_open(ConnectionState::Closing) {
                    // We initiated the close; this is the peer's reply.
                    self.state.set(ConnectionState::Closed);
                }
                Poll::Ready(Some(Ok(msg)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.state.set(ConnectionState::Closed);
                Poll::Ready(Some(Err(WsError::from(e))))
            }
            Poll::Ready(None) => {
                self.state.set(ConnectionState::Closed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A handle for sending messages to a WebSocket from other tasks.
///
/// Sends are serialised per connection by an async mutex around the sink.
pub struct WebSocketSender<S = tokio::net::TcpStream> {
    sender: Sink<S>,
    state: SharedState,
}

impl<S> Clone for WebSocketSender<S> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
            state: self.state.clone(),
        }
    }
}

impl<S> WebSocketSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send a message.
    #[instrument(skip(self, msg), fields(msg_type = msg.kind()))]
    pub async fn send(&self, msg: Message) -> WsResult<()> {
        if self.state.get() != ConnectionState::Open {
            return Err(WsError::connection_closed(
                Some(CloseCode::Normal.as_u16()),
                "connection is not open",
            ));
        }

        let mut sender = self.sender.lock().await;
        sender.send(msg.into()).await.map_err(|e| {
            let err = WsError::from(e);
            if err.is_premature_termination() {
                self.state.set(ConnectionState::Closed);
            }
            WsError::send_failed(err.to_string())
        })
    }

    /// Flush whatever the protocol layer has queued, such as a close reply.
    async fn flush(&self) -> WsResult<()> {
        let mut sender = self.sender.lock().await;
        match sender.flush().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = WsError::from(e);
                if err.is_premature_termination() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

#[async_trait]
impl<S> ClientConnection for WebSocketSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn send_text(&self, text: &str) -> WsResult<()> {
        self.send(Message::text(text)).await
    }

    async fn close(&self, code: CloseCode, reason: &str) -> WsResult<()> {
        match self.state.get() {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Closing => {
                let result = self.flush().await;
                self.state.set(ConnectionState::Closed);
                return result;
            }
            ConnectionState::Open => {}
        }

        if !self.state.leave_open(ConnectionState::Closing) {
            // Lost a race with another closer or the receive half.
            return Ok(());
        }

        debug!(code = code.as_u16(), reason = %reason, "Closing connection");

        let mut sender = self.sender.lock().await;
        match sender.send(Message::close(code, reason).into()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.set(ConnectionState::Closed);
                let err = WsError::from(e);
                if err.is_premature_termination() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

//! Per-connection receive loop.
//!
//! One loop runs per registered client. It awaits one message at a time, so
//! a client's messages reach the event bus in arrival order.

use std::fmt;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use hermes_telemetry::metrics::record_message_received;
use hermes_ws::{ClientConnection, ClientId, CloseCode, ConnectionState, Message, WsResult};
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, ServerEvent};
use crate::shutdown::ShutdownSignal;

/// How long a loop stopped by shutdown waits for the peer's close reply.
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Reason sent when a loop ends with the connection still open.
pub const INTERNAL_ERROR_REASON: &str = "Receive loop terminated";

/// Why a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopExit {
    /// The client sent a close frame.
    CloseFrame,
    /// The transport ended without a closing handshake.
    PeerGone,
    /// The server is shutting down.
    Shutdown,
    /// A receive error other than a disconnect.
    Error,
}

impl LoopExit {
    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CloseFrame => "close_frame",
            Self::PeerGone => "peer_gone",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
        }
    }

    /// Whether the loop ended without a fault.
    pub fn is_clean(self) -> bool {
        !matches!(self, Self::Error)
    }
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pull messages from `stream` until the client leaves.
///
/// Data messages are emitted as [`ServerEvent::MessageReceived`]; binary
/// payloads are decoded as lossy UTF-8 over exactly their length. A close
/// frame is answered with a normal closure. Whatever the exit, a connection
/// that is still open afterwards is closed with an internal-error code.
pub async fn receive_loop<St>(
    client_id: ClientId,
    mut stream: St,
    connection: &dyn ClientConnection,
    events: &EventBus,
    shutdown: &ShutdownSignal,
) -> LoopExit
where
    St: Stream<Item = WsResult<Message>> + Unpin,
{
    let mut shutdown_rx = shutdown.recv();

    let exit = loop {
        if connection.state() == ConnectionState::Closed {
            break LoopExit::PeerGone;
        }

        let next = tokio::select! {
            biased;
            () = &mut shutdown_rx => break LoopExit::Shutdown,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Close(frame))) => {
                debug!(
                    client_id = %client_id,
                    code = frame.as_ref().map(|f| f.code),
                    "Close frame received"
                );
                if let Err(e) = connection.close(CloseCode::Normal, "").await {
                    debug!(client_id = %client_id, error = %e, "Failed to complete closing handshake");
                }
                break LoopExit::CloseFrame;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(message)) => {
                if let Some(text) = message.into_text_lossy() {
                    record_message_received();
                    events.emit(&ServerEvent::message_received(client_id, text));
                }
            }
            Some(Err(e)) if e.is_premature_termination() => {
                info!(client_id = %client_id, error = %e, "Client disconnected without closing handshake");
                break LoopExit::PeerGone;
            }
            Some(Err(e)) => {
                error!(client_id = %client_id, error = %e, "Error receiving message from client");
                break LoopExit::Error;
            }
            None => break LoopExit::PeerGone,
        }
    };

    if connection.is_open() {
        if let Err(e) = connection
            .close(CloseCode::InternalError, INTERNAL_ERROR_REASON)
            .await
        {
            warn!(client_id = %client_id, error = %e, "Failed to close connection");
        }
    }

    if exit == LoopExit::Shutdown {
        await_close_reply(client_id, &mut stream).await;
    }

    debug!(client_id = %client_id, exit = %exit, "Receive loop finished");
    exit
}

/// Read until the peer acknowledges our close, bounded by
/// [`CLOSE_HANDSHAKE_TIMEOUT`].
async fn await_close_reply<St>(client_id: ClientId, stream: &mut St)
where
    St: Stream<Item = WsResult<Message>> + Unpin,
{
    let drain = async {
        while let Some(Ok(message)) = stream.next().await {
            if message.is_close() {
                break;
            }
        }
    };

    if tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, drain).await.is_err() {
        debug!(client_id = %client_id, "Peer did not acknowledge close");
    }
}

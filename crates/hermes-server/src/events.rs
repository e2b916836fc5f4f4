//! Server event fan-out.
//!
//! The server reports four notifications. Every registered listener receives
//! every event, in registration order, on the task that emitted it: a slow
//! listener delays that connection's receive loop, nothing else.
//!
//! ```rust
//! use hermes_server::{EventBus, ServerEvent};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let bus = EventBus::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//! bus.subscribe(move |_event: &ServerEvent| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! bus.emit(&ServerEvent::server_started());
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hermes_ws::ClientId;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Message carried by [`ServerEvent::ServerStarted`].
pub const SERVER_STARTED: &str = "Server started";

/// Message carried by [`ServerEvent::ClientConnected`].
pub const CLIENT_CONNECTED: &str = "WebSocket connected";

/// Message carried by [`ServerEvent::ClientDisconnected`].
pub const CLIENT_DISCONNECTED: &str = "WebSocket disconnected";

/// A server notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The listener is bound and accepting.
    ServerStarted {
        /// Human-readable description.
        message: String,
    },

    /// A client completed the upgrade and was registered.
    ClientConnected {
        /// The new client.
        client_id: ClientId,
        /// Human-readable description.
        message: String,
    },

    /// A client was removed after its receive loop ended.
    ClientDisconnected {
        /// The departed client.
        client_id: ClientId,
        /// Human-readable description.
        message: String,
    },

    /// A client sent a data message.
    MessageReceived {
        /// The sender.
        client_id: ClientId,
        /// The received text.
        message: String,
    },
}

/// Discriminant of a [`ServerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`ServerEvent::ServerStarted`].
    ServerStarted,
    /// See [`ServerEvent::ClientConnected`].
    ClientConnected,
    /// See [`ServerEvent::ClientDisconnected`].
    ClientDisconnected,
    /// See [`ServerEvent::MessageReceived`].
    MessageReceived,
}

impl EventKind {
    /// Stable name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerStarted => "server_started",
            Self::ClientConnected => "client_connected",
            Self::ClientDisconnected => "client_disconnected",
            Self::MessageReceived => "message_received",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServerEvent {
    /// `ServerStarted` with the standard message.
    pub fn server_started() -> Self {
        Self::ServerStarted {
            message: SERVER_STARTED.to_string(),
        }
    }

    /// `ClientConnected` with the standard message.
    pub fn client_connected(client_id: ClientId) -> Self {
        Self::ClientConnected {
            client_id,
            message: CLIENT_CONNECTED.to_string(),
        }
    }

    /// `ClientDisconnected` with the standard message.
    pub fn client_disconnected(client_id: ClientId) -> Self {
        Self::ClientDisconnected {
            client_id,
            message: CLIENT_DISCONNECTED.to_string(),
        }
    }

    /// `MessageReceived` carrying `text`.
    pub fn message_received(client_id: ClientId, text: impl Into<String>) -> Self {
        Self::MessageReceived {
            client_id,
            message: text.into(),
        }
    }

    /// The event's kind.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ServerStarted { .. } => EventKind::ServerStarted,
            Self::ClientConnected { .. } => EventKind::ClientConnected,
            Self::ClientDisconnected { .. } => EventKind::ClientDisconnected,
            Self::MessageReceived { .. } => EventKind::MessageReceived,
        }
    }

    /// The client the event concerns, if any.
    pub fn client_id(&self) -> Option<ClientId> {
        match self {
            Self::ServerStarted { .. } => None,
            Self::ClientConnected { client_id, .. }
            | Self::ClientDisconnected { client_id, .. }
            | Self::MessageReceived { client_id, .. } => Some(*client_id),
        }
    }

    /// The event's message text.
    pub fn message(&self) -> &str {
        match self {
            Self::ServerStarted { message }
            | Self::ClientConnected { message, .. }
            | Self::ClientDisconnected { message, .. }
            | Self::MessageReceived { message, .. } => message,
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(id) => write!(f, "[{}] {}: {}", self.kind(), id, self.message()),
            None => write!(f, "[{}] {}", self.kind(), self.message()),
        }
    }
}

/// Receives server events.
///
/// Implemented for every `Fn(&ServerEvent) + Send + Sync` closure.
pub trait EventListener: Send + Sync {
    /// Handle one event. Must not block for long.
    fn on_event(&self, event: &ServerEvent);

    /// Whether this listener can be dropped from the bus.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> EventListener for F
where
    F: Fn(&ServerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ServerEvent) {
        self(event);
    }
}

struct ChannelListener {
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &ServerEvent) {
        let _ = self.sender.send(event.clone());
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Multicast delivery of [`ServerEvent`]s.
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EventListener>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener. It receives every event emitted from now on.
    pub fn subscribe<L>(&self, listener: L) -> ListenerId
    where
        L: EventListener + 'static,
    {
        self.subscribe_arc(Arc::new(listener))
    }

    /// Register a shared listener.
    pub fn subscribe_arc(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Deliver events into an unbounded channel.
    ///
    /// The listener is removed once the receiver is dropped.
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribe(ChannelListener { sender });
        receiver
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every listener, in registration order.
    ///
    /// A panicking listener is logged and skipped; the remaining listeners
    /// still run and the caller is unaffected.
    pub fn emit(&self, event: &ServerEvent) {
        // Listeners may subscribe from inside a callback, so never call out
        // while holding the lock.
        let listeners = self.listeners.read().clone();
        trace!(event = %event.kind(), listeners = listeners.len(), "Emitting event");

        let mut saw_closed = false;
        for (id, listener) in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
                error!(listener = id.0, event = %event.kind(), "Event listener panicked");
            }
            saw_closed |= listener.is_closed();
        }

        if saw_closed {
            self.listeners.write().retain(|(_, listener)| !listener.is_closed());
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

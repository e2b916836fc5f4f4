//! The WebSocket server.
//!
//! [`WebSocketServer`] owns the listener, the client registry and the event
//! bus. It is a cheap handle: clones share the same server, so the host
//! application can keep one clone for sending while another runs the
//! server.
//!
//! # Example
//!
//! ```rust,ignore
//! use hermes_server::{ServerConfig, ServerEvent, WebSocketServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = WebSocketServer::new(ServerConfig::from_prefix("http://localhost:20005/")?);
//!
//!     let echo = server.clone();
//!     let mut events = server.events().subscribe_channel();
//!     server.start().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let ServerEvent::MessageReceived { client_id, message } = event {
//!             echo.send_to_client(client_id, &message).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use hermes_telemetry::metrics::record_message_sent;
use hermes_ws::{ClientId, ClientRegistry, CloseCode, WsError, WsResult};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::events::{EventBus, ServerEvent};
use crate::handler::{serve_http, HandlerContext};
use crate::shutdown::{ConnectionTracker, ShutdownSignal};

/// Reason sent to every client when the server stops.
pub const STOP_REASON: &str = "Server stopping";

/// Pause after an accept failure caused by descriptor or memory exhaustion.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of a [`WebSocketServer`]. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerLifecycleState {
    /// Constructed, not yet bound.
    NotStarted,
    /// Bound and accepting.
    Listening,
    /// Stopped; terminal.
    Stopped,
}

impl fmt::Display for ServerLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Listening => write!(f, "listening"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Outcome of [`WebSocketServer::broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Clients that received the message.
    pub delivered: Vec<ClientId>,
    /// Clients whose send failed, with the reason.
    pub failed: Vec<(ClientId, WsError)>,
}

impl BroadcastReport {
    /// Number of recipients the message reached.
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    /// Number of recipients the send failed for.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Whether every recipient received the message.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// How the accept loop reacts to an `accept()` failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Only the connection being accepted is affected.
    Transient,
    /// Out of descriptors or memory; retry after [`ACCEPT_BACKOFF`].
    ResourceExhausted,
    /// The listener itself is broken.
    Fatal,
}

fn classify_accept_error(err: &io::Error) -> AcceptFailure {
    use io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut => AcceptFailure::Transient,
        ErrorKind::OutOfMemory => AcceptFailure::ResourceExhausted,
        _ if is_descriptor_exhaustion(err) => AcceptFailure::ResourceExhausted,
        _ => AcceptFailure::Fatal,
    }
}

fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    // ENFILE / EMFILE, and WSAEMFILE on Windows.
    matches!(err.raw_os_error(), Some(23 | 24 | 10024))
}

struct Inner {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    events: Arc<EventBus>,
    shutdown: ShutdownSignal,
    tracker: ConnectionTracker,
    lifecycle: watch::Sender<ServerLifecycleState>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    control: tokio::sync::Mutex<()>,
}

impl Inner {
    fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
            prefix: self.config.prefix().clone(),
            websocket: self.config.websocket().clone(),
        }
    }

    /// Close every registered client, refuse new ones and signal shutdown.
    async fn drain(&self) {
        // `put` holds the closed-flag read lock across its insert, so once
        // `close` returns the snapshot below sees every registered client.
        self.registry.close();
        let clients = self.registry.snapshot();

        debug!(clients = clients.len(), "Closing registered clients");
        let closes = clients.iter().map(|client| async move {
            if client.connection.is_open() {
                if let Err(e) = client.connection.close(CloseCode::Normal, STOP_REASON).await {
                    warn!(client_id = %client.id, error = %e, "Failed to close client during shutdown");
                }
            }
        });
        join_all(closes).await;

        let cleared = self.registry.clear();
        debug!(cleared, "Client registry cleared");
        self.shutdown.trigger();
    }
}

/// A WebSocket server bound to one listener prefix.
#[derive(Clone)]
pub struct WebSocketServer {
    inner: Arc<Inner>,
}

impl WebSocketServer {
    /// Create a server. Nothing is bound until [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ClientRegistry::new(config.registry_config()));
        let (lifecycle, _) = watch::channel(ServerLifecycleState::NotStarted);

        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                events: Arc::new(EventBus::new()),
                shutdown: ShutdownSignal::new(),
                tracker: ConnectionTracker::new(),
                lifecycle,
                local_addr: Mutex::new(None),
                accept_task: Mutex::new(None),
                control: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// The event bus. Subscribe before [`start`](Self::start) to see
    /// `ServerStarted`.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// The client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.inner.registry
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerLifecycleState {
        *self.inner.lifecycle.borrow()
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Emits `ServerStarted` and returns the bound address; with port `0`
    /// in the prefix this is the port the OS picked.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let _control = self.inner.control.lock().await;
        match self.state() {
            ServerLifecycleState::NotStarted => {}
            ServerLifecycleState::Listening => return Err(ServerError::AlreadyStarted),
            ServerLifecycleState::Stopped => return Err(ServerError::AlreadyStopped),
        }

        let addr = self.inner.config.prefix().bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        *self.inner.local_addr.lock() = Some(local_addr);
        self.inner.lifecycle.send_replace(ServerLifecycleState::Listening);
        info!(addr = %local_addr, prefix = %self.inner.config.prefix(), "Server listening");
        self.inner.events.emit(&ServerEvent::server_started());

        let handle = tokio::spawn(accept_loop(listener, Arc::clone(&self.inner)));
        *self.inner.accept_task.lock() = Some(handle);

        Ok(local_addr)
    }

    /// Start, then wait until the server is stopped.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.start().await?;
        self.wait().await;
        Ok(())
    }

    /// Start, then stop when `shutdown` fires.
    pub async fn run_with_shutdown(&self, shutdown: ShutdownSignal) -> Result<(), ServerError> {
        self.start().await?;
        tokio::select! {
            () = shutdown.recv() => {
                info!("Shutdown signal received, stopping server");
                self.stop().await;
            }
            () = self.wait() => {}
        }
        Ok(())
    }

    /// Wait until the server reaches `Stopped`.
    pub async fn wait(&self) {
        let mut lifecycle = self.inner.lifecycle.subscribe();
        // The sender lives as long as `self`, so this only returns once stopped.
        let _ = lifecycle
            .wait_for(|state| *state == ServerLifecycleState::Stopped)
            .await;
    }

    /// Send `text` to one client as a single text message.
    ///
    /// Fails with [`WsError::NotConnected`] if the client is unknown or no
    /// longer open; nothing is sent in that case.
    pub async fn send_to_client(&self, client_id: ClientId, text: &str) -> WsResult<()> {
        let client = match self.inner.registry.get(&client_id) {
            Ok(client) if client.connection.is_open() => client,
            Ok(_) | Err(_) => {
                warn!(client_id = %client_id, "Error sending message to client: not connected");
                return Err(WsError::not_connected(client_id));
            }
        };

        let result = client.connection.send_text(text).await;
        record_message_sent(result.is_ok());
        if let Err(e) = &result {
            error!(client_id = %client_id, error = %e, "Error sending message to client");
        }
        result
    }

    /// Send `text` to every registered client.
    ///
    /// Sends run concurrently over a registry snapshot; one failure does not
    /// affect the others.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        let ids = self.inner.registry.ids();
        let sends = ids.iter().map(|id| self.send_to_client(*id, text));
        let results = join_all(sends).await;

        let mut report = BroadcastReport::default();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(()) => report.delivered.push(id),
                Err(e) => report.failed.push((id, e)),
            }
        }
        debug!(
            delivered = report.delivered_count(),
            failed = report.failed_count(),
            "Broadcast finished"
        );
        report
    }

    /// Ids of the registered clients, in connection order.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.inner.registry.ids()
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Close every client, clear the registry and stop accepting.
    ///
    /// Waits up to the configured shutdown timeout for connection tasks to
    /// finish. Calling it again, or concurrently, is a no-op.
    pub async fn stop(&self) {
        let _control = self.inner.control.lock().await;
        if self.state() == ServerLifecycleState::Stopped {
            debug!("Server already stopped");
            return;
        }

        info!(clients = self.client_count(), "Stopping server");
        self.inner.drain().await;

        let accept_task = self.inner.accept_task.lock().take();
        if let Some(handle) = accept_task {
            if let Err(e) = handle.await {
                error!(error = %e, "Accept loop task failed");
            }
        }

        let timeout = self.inner.config.shutdown_timeout();
        let tracker = &self.inner.tracker;
        if tokio::time::timeout(timeout, tracker.wait_for_shutdown())
            .await
            .is_err()
        {
            warn!(
                remaining = tracker.active_connections(),
                "Shutdown timeout reached with connections still active"
            );
        }

        self.inner.lifecycle.send_replace(ServerLifecycleState::Stopped);
        info!("Server stopped");
    }
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("prefix", &self.inner.config.prefix().to_string())
            .field("state", &self.state())
            .field("clients", &self.client_count())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.recv();

    loop {
        tokio::select! {
            () = &mut shutdown => {
                debug!("Accept loop stopping");
                return;
            }
            result = listener.accept() => match result {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Accepted connection");
                    let ctx = inner.handler_context();
                    let token = inner.tracker.acquire();
                    tokio::spawn(async move {
                        serve_http(stream, peer_addr, ctx).await;
                        drop(token);
                    });
                }
                Err(e) => match classify_accept_error(&e) {
                    AcceptFailure::Transient => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                    AcceptFailure::ResourceExhausted => {
                        warn!(error = %e, "Failed to accept connection, backing off");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    AcceptFailure::Fatal => {
                        error!(error = %e, "Listener failed, stopping server");
                        break;
                    }
                },
            },
        }
    }

    inner.drain().await;
    inner.lifecycle.send_replace(ServerLifecycleState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_ws::MemoryConnection;

    fn test_server() -> WebSocketServer {
        WebSocketServer::new(
            ServerConfig::from_prefix("http://127.0.0.1:0/")
                .unwrap()
                .to_builder()
                .shutdown_timeout(Duration::from_secs(1))
                .build(),
        )
    }

    #[test]
    fn test_classify_accept_errors() {
        use io::ErrorKind;

        for kind in [
            ErrorKind::ConnectionAborted,
            ErrorKind::ConnectionReset,
            ErrorKind::Interrupted,
            ErrorKind::WouldBlock,
            ErrorKind::TimedOut,
        ] {
            assert_eq!(
                classify_accept_error(&io::Error::from(kind)),
                AcceptFailure::Transient
            );
        }

        assert_eq!(
            classify_accept_error(&io::Error::from_raw_os_error(24)),
            AcceptFailure::ResourceExhausted
        );
        assert_eq!(
            classify_accept_error(&io::Error::from(ErrorKind::OutOfMemory)),
            AcceptFailure::ResourceExhausted
        );
        assert_eq!(
            classify_accept_error(&io::Error::from(ErrorKind::InvalidInput)),
            AcceptFailure::Fatal
        );
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let server = test_server();
        assert_eq!(server.state(), ServerLifecycleState::NotStarted);
        assert!(server.local_addr().is_none());

        let addr = server.start().await.unwrap();
        assert_eq!(server.state(), ServerLifecycleState::Listening);
        assert_eq!(server.local_addr(), Some(addr));
        assert_ne!(addr.port(), 0);

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyStarted));

        server.stop().await;
        assert_eq!(server.state(), ServerLifecycleState::Stopped);

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyStopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_closes_clients_registered_during_drain() {
        for _ in 0..20 {
            let server = test_server();
            let registered = Arc::new(Mutex::new(Vec::new()));

            let workers: Vec<_> = (0..3)
                .map(|_| {
                    let registry = Arc::clone(server.registry());
                    let registered = Arc::clone(&registered);
                    std::thread::spawn(move || loop {
                        let conn = Arc::new(MemoryConnection::new());
                        match registry.put(ClientId::new(), conn.clone()) {
                            Ok(()) => registered.lock().push(conn),
                            Err(WsError::RegistryClosed) => break,
                            Err(e) => panic!("unexpected registry error: {e}"),
                        }
                    })
                })
                .collect();

            tokio::time::sleep(Duration::from_millis(1)).await;
            server.stop().await;
            for worker in workers {
                worker.join().unwrap();
            }

            let registered = registered.lock();
            let missed = registered.iter().filter(|c| c.closes().is_empty()).count();
            assert_eq!(missed, 0, "{missed} of {} clients got no close", registered.len());
            for conn in registered.iter() {
                assert_eq!(conn.closes(), vec![(CloseCode::Normal, STOP_REASON.to_string())]);
            }
            assert!(server.registry().is_empty());
        }
    }

    #[tokio::test]
    async fn test_run_with_shutdown_stops_on_trigger() {
        let server = test_server();
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn({
            let server = server.clone();
            let shutdown = shutdown.clone();
            async move { server.run_with_shutdown(shutdown).await }
        });

        while server.state() != ServerLifecycleState::Listening {
            tokio::task::yield_now().await;
        }
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run_with_shutdown should return")
            .unwrap()
            .unwrap();
        assert_eq!(server.state(), ServerLifecycleState::Stopped);
        assert!(server.registry().is_closed());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let server = test_server();
        server.stop().await;
        assert_eq!(server.state(), ServerLifecycleState::Stopped);
        assert!(server.registry().is_closed());
    }

    #[tokio::test]
    async fn test_started_event_is_emitted() {
        let server = test_server();
        let mut events = server.events().subscribe_channel();
        server.start().await.unwrap();

        assert_eq!(events.recv().await, Some(ServerEvent::server_started()));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = test_server();
        let addr = first.start().await.unwrap();

        let second = WebSocketServer::new(
            ServerConfig::from_prefix(&format!("http://127.0.0.1:{}/", addr.port())).unwrap(),
        );
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert_eq!(second.state(), ServerLifecycleState::NotStarted);

        first.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let server = test_server();
        let err = server
            .send_to_client(ClientId::new(), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_send_to_closing_client_is_not_connected() {
        let server = test_server();
        let id = ClientId::new();
        let conn = Arc::new(MemoryConnection::new());
        server.registry().put(id, conn.clone()).unwrap();

        conn.set_state(hermes_ws::ConnectionState::Closing);
        let err = server.send_to_client(id, "late").await.unwrap_err();

        assert!(matches!(err, WsError::NotConnected { client_id } if client_id == id));
        assert!(conn.sent().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_survives_one_failure() {
        let server = test_server();
        let conns = [
            Arc::new(MemoryConnection::new()),
            Arc::new(MemoryConnection::failing()),
            Arc::new(MemoryConnection::new()),
        ];
        let ids: Vec<ClientId> = conns
            .iter()
            .map(|conn| {
                let id = ClientId::new();
                server.registry().put(id, conn.clone()).unwrap();
                id
            })
            .collect();

        let report = server.broadcast("hello").await;

        assert_eq!(report.delivered, vec![ids[0], ids[2]]);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.failed[0].0, ids[1]);
        assert!(!report.is_complete());
        assert_eq!(conns[0].sent(), vec!["hello"]);
        assert!(conns[1].sent().is_empty());
        assert_eq!(conns[2].sent(), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_stop_closes_registered_clients() {
        let server = test_server();
        server.start().await.unwrap();

        let conn = Arc::new(MemoryConnection::new());
        server.registry().put(ClientId::new(), conn.clone()).unwrap();

        server.stop().await;
        server.stop().await;

        assert_eq!(conn.closes(), vec![(CloseCode::Normal, STOP_REASON.to_string())]);
        assert_eq!(server.client_count(), 0);
        assert!(server.registry().put(ClientId::new(), conn).is_err());
    }

    #[tokio::test]
    async fn test_wait_returns_after_stop() {
        let server = test_server();
        server.start().await.unwrap();

        let waiter = tokio::spawn({
            let server = server.clone();
            async move { server.wait().await }
        });
        server.stop().await;

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("wait should return")
            .unwrap();
    }
}

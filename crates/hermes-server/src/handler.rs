//! HTTP serving and per-connection handling.
//!
//! Every accepted TCP stream is served as HTTP/1.1. Upgrade requests under
//! the listener path get `101 Switching Protocols` and continue in their own
//! task; everything else gets a plain-text error status.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hermes_telemetry::metrics::{record_disconnect, record_upgrade_rejected};
use hermes_telemetry::ConnectionGuard;
use hermes_ws::{
    complete_upgrade, prepare_upgrade, text_response, ClientConnection, ClientId, ClientRegistry,
    CloseCode, WebSocket, WebSocketConfig, WsError,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ListenerPrefix;
use crate::events::{EventBus, ServerEvent};
use crate::receive::{receive_loop, LoopExit, INTERNAL_ERROR_REASON};
use crate::shutdown::{ConnectionTracker, ShutdownSignal};

/// Reason sent to clients refused because the server is full.
pub const CAPACITY_REASON: &str = "Server is at capacity";

/// Reason sent to clients refused because the server is stopping.
pub const SHUTTING_DOWN_REASON: &str = "Server is shutting down";

/// Shared state every connection task needs.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Registered clients.
    pub registry: Arc<ClientRegistry>,
    /// Event fan-out.
    pub events: Arc<EventBus>,
    /// Server-wide shutdown.
    pub shutdown: ShutdownSignal,
    /// Tracks spawned connection tasks.
    pub tracker: ConnectionTracker,
    /// Which request paths are served.
    pub prefix: ListenerPrefix,
    /// Protocol limits for upgraded connections.
    pub websocket: WebSocketConfig,
}

/// Serve one accepted TCP stream until it closes, upgrades, or the server
/// shuts down.
pub async fn serve_http(stream: TcpStream, peer_addr: SocketAddr, ctx: HandlerContext) {
    let io = TokioIo::new(stream);
    let shutdown = ctx.shutdown.clone();

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(route_request(req, peer_addr, ctx)) }
    });

    let conn = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades();

    tokio::select! {
        result = conn => {
            if let Err(e) = result {
                debug!(peer_addr = %peer_addr, error = %e, "HTTP connection error");
            }
        }
        () = shutdown.recv() => {
            debug!(peer_addr = %peer_addr, "HTTP connection closed due to shutdown");
        }
    }
}

/// Answer one HTTP request.
///
/// Paths outside the prefix get `404`, non-upgrade requests `400`. A valid
/// upgrade spawns the connection task and returns `101`.
fn route_request(
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    ctx: HandlerContext,
) -> Response<Full<Bytes>> {
    if !ctx.prefix.matches_path(req.uri().path()) {
        debug!(peer_addr = %peer_addr, path = req.uri().path(), "Request outside listener prefix");
        record_upgrade_rejected("not_found");
        return text_response(StatusCode::NOT_FOUND, "Not Found");
    }

    let upgrade = prepare_upgrade(&req);
    if !upgrade.success {
        debug!(peer_addr = %peer_addr, method = %req.method(), "Rejected non-upgrade request");
        record_upgrade_rejected("not_websocket");
        return upgrade.response;
    }

    let token = ctx.tracker.acquire();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws = complete_upgrade(TokioIo::new(upgraded), ctx.websocket.clone()).await;
                handle_connection(ws, peer_addr, &ctx).await;
            }
            Err(e) => {
                error!(peer_addr = %peer_addr, error = %e, "WebSocket error");
                record_upgrade_rejected("upgrade_failed");
            }
        }
        drop(token);
    });

    upgrade.response
}

/// Run one upgraded connection from registration to cleanup.
///
/// Registers the client, emits `ClientConnected`, runs the receive loop and
/// then, however the loop ended, closes the connection if it is still open,
/// removes it from the registry and emits `ClientDisconnected`. A panic in
/// the loop is caught so cleanup still runs.
#[instrument(skip_all, fields(peer_addr = %peer_addr))]
pub async fn handle_connection<S>(ws: WebSocket<S>, peer_addr: SocketAddr, ctx: &HandlerContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client_id = ClientId::new();
    let connection: Arc<dyn ClientConnection> = Arc::new(ws.sender());

    if let Err(e) = ctx.registry.put(client_id, Arc::clone(&connection)) {
        let (code, reason, label) = match e {
            WsError::CapacityReached { .. } => {
                (CloseCode::TryAgainLater, CAPACITY_REASON, "capacity")
            }
            _ => (CloseCode::GoingAway, SHUTTING_DOWN_REASON, "shutting_down"),
        };
        warn!(client_id = %client_id, error = %e, "Refusing WebSocket connection");
        record_upgrade_rejected(label);
        if let Err(e) = connection.close(code, reason).await {
            debug!(client_id = %client_id, error = %e, "Failed to close refused connection");
        }
        return;
    }

    let _guard = ConnectionGuard::new();
    info!(client_id = %client_id, "WebSocket connected");
    ctx.events.emit(&ServerEvent::client_connected(client_id));

    let outcome = std::panic::AssertUnwindSafe(receive_loop(
        client_id,
        ws,
        connection.as_ref(),
        &ctx.events,
        &ctx.shutdown,
    ))
    .catch_unwind()
    .await;

    let exit = outcome.unwrap_or_else(|_| {
        error!(client_id = %client_id, "Receive loop panicked");
        LoopExit::Error
    });
    record_disconnect(exit.as_str());

    if connection.is_open() {
        if let Err(e) = connection
            .close(CloseCode::InternalError, INTERNAL_ERROR_REASON)
            .await
        {
            warn!(client_id = %client_id, error = %e, "WebSocket error");
        }
    }

    ctx.registry.remove(&client_id);
    info!(client_id = %client_id, exit = %exit, "WebSocket disconnected");
    ctx.events.emit(&ServerEvent::client_disconnected(client_id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use hermes_ws::RegistryConfig;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message as WireMessage;
    use tokio_tungstenite::WebSocketStream;

    fn context(registry: RegistryConfig) -> HandlerContext {
        HandlerContext {
            registry: Arc::new(ClientRegistry::new(registry)),
            events: Arc::new(EventBus::new()),
            shutdown: ShutdownSignal::new(),
            tracker: ConnectionTracker::new(),
            prefix: ListenerPrefix::default(),
            websocket: WebSocketConfig::default(),
        }
    }

    async fn pair() -> (WebSocket<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = complete_upgrade(server_io, WebSocketConfig::default()).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_connection_lifecycle_events() {
        let ctx = context(RegistryConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registry = Arc::clone(&ctx.registry);
        ctx.events.subscribe(move |event: &ServerEvent| {
            // Registered for exactly as long as the connect/disconnect pair says.
            let registered = event.client_id().is_some_and(|id| registry.contains(&id));
            sink.lock().push((event.kind(), registered));
        });

        let (server, mut client) = pair().await;
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { handle_connection(server, peer(), &ctx).await }
        });

        client.send(WireMessage::Text("hello".into())).await.unwrap();
        client.close(None).await.unwrap();
        while client.next().await.is_some() {}

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("handler should finish")
            .unwrap();

        use crate::events::EventKind::{ClientConnected, ClientDisconnected, MessageReceived};
        assert_eq!(
            *seen.lock(),
            vec![
                (ClientConnected, true),
                (MessageReceived, true),
                (ClientDisconnected, false),
            ]
        );
        assert!(ctx.registry.is_empty());
    }

    /// A transport whose reads panic and whose writes are discarded.
    struct PanickingReader;

    impl AsyncRead for PanickingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            panic!("transport read failed");
        }
    }

    impl AsyncWrite for PanickingReader {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_panicking_loop_still_cleans_up() {
        let ctx = context(RegistryConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.events
            .subscribe(move |event: &ServerEvent| sink.lock().push(event.kind()));

        let ws = complete_upgrade(PanickingReader, WebSocketConfig::default()).await;
        tokio::time::timeout(Duration::from_secs(5), handle_connection(ws, peer(), &ctx))
            .await
            .expect("handler should finish after the panic");

        use crate::events::EventKind::{ClientConnected, ClientDisconnected};
        assert_eq!(*seen.lock(), vec![ClientConnected, ClientDisconnected]);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_refusal_closes_without_events() {
        let ctx = context(RegistryConfig::default().max_connections(0));
        let events = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&events);
        ctx.events.subscribe(move |_: &ServerEvent| *counter.lock() += 1);

        let (server, mut client) = pair().await;
        handle_connection(server, peer(), &ctx).await;

        match client.next().await {
            Some(Ok(WireMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), CloseCode::TryAgainLater.as_u16());
                assert_eq!(frame.reason.as_str(), CAPACITY_REASON);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(*events.lock(), 0);
    }

    #[tokio::test]
    async fn test_closed_registry_refuses_with_going_away() {
        let ctx = context(RegistryConfig::default());
        ctx.registry.close();

        let (server, mut client) = pair().await;
        handle_connection(server, peer(), &ctx).await;

        match client.next().await {
            Some(Ok(WireMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), CloseCode::GoingAway.as_u16());
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_ends_connection() {
        let ctx = context(RegistryConfig::default());
        let (server, mut client) = pair().await;
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { handle_connection(server, peer(), &ctx).await }
        });

        while ctx.registry.is_empty() {
            tokio::task::yield_now().await;
        }
        ctx.shutdown.trigger();

        match client.next().await {
            Some(Ok(WireMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), CloseCode::InternalError.as_u16());
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        while client.next().await.is_some() {}

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("handler should finish")
            .unwrap();
        assert!(ctx.registry.is_empty());
    }
}

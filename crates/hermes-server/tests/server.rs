//! End-to-end tests against a real listener on 127.0.0.1.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hermes_server::{ServerConfig, ServerEvent, ServerLifecycleState, WebSocketServer};
use hermes_ws::{ClientId, CloseCode, WsError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message as WireMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn config(prefix: &str) -> ServerConfig {
    ServerConfig::from_prefix(prefix)
        .unwrap()
        .to_builder()
        .shutdown_timeout(Duration::from_millis(500))
        .build()
}

async fn start(config: ServerConfig) -> (WebSocketServer, SocketAddr, UnboundedReceiver<ServerEvent>) {
    let server = WebSocketServer::new(config);
    let mut events = server.events().subscribe_channel();
    let addr = server.start().await.unwrap();
    assert_eq!(next_event(&mut events).await, ServerEvent::server_started());
    (server, addr, events)
}

async fn next_event(events: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    client
}

async fn connect_registered(
    addr: SocketAddr,
    events: &mut UnboundedReceiver<ServerEvent>,
) -> (Client, ClientId) {
    let client = connect(addr, "/").await;
    match next_event(events).await {
        ServerEvent::ClientConnected { client_id, .. } => (client, client_id),
        other => panic!("expected ClientConnected, got {other:?}"),
    }
}

async fn next_message(client: &mut Client) -> WireMessage {
    tokio::time::timeout(WAIT, client.next())
        .await
        .expect("timed out waiting for message")
        .expect("stream ended")
        .expect("receive error")
}

async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .expect("timed out reading response")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn ping_is_received_and_pong_is_delivered() {
    let (server, addr, mut events) = start(config("http://127.0.0.1:0/")).await;
    let (mut client, id) = connect_registered(addr, &mut events).await;

    client.send(WireMessage::Text("ping".into())).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ServerEvent::message_received(id, "ping")
    );

    server.send_to_client(id, "pong").await.unwrap();
    match next_message(&mut client).await {
        WireMessage::Text(text) => assert_eq!(text.as_str(), "pong"),
        other => panic!("expected text, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn client_close_leaves_only_the_other_client() {
    let (server, addr, mut events) = start(config("http://127.0.0.1:0/")).await;
    let (mut first, first_id) = connect_registered(addr, &mut events).await;
    let (_second, second_id) = connect_registered(addr, &mut events).await;
    assert_eq!(server.client_ids(), vec![first_id, second_id]);

    first.close(None).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ServerEvent::client_disconnected(first_id)
    );
    assert_eq!(server.client_ids(), vec![second_id]);

    let err = server.send_to_client(first_id, "gone").await.unwrap_err();
    assert!(matches!(err, WsError::NotConnected { .. }));

    server.stop().await;

    while let Ok(event) = events.try_recv() {
        if event.client_id() == Some(first_id) {
            panic!("unexpected event after disconnect: {event:?}");
        }
    }
}

#[tokio::test]
async fn messages_from_one_client_arrive_in_order() {
    let (server, addr, mut events) = start(config("http://127.0.0.1:0/")).await;
    let (mut client, id) = connect_registered(addr, &mut events).await;

    for n in 0..20 {
        client.send(WireMessage::Text(n.to_string().into())).await.unwrap();
    }
    for n in 0..20 {
        assert_eq!(
            next_event(&mut events).await,
            ServerEvent::message_received(id, n.to_string())
        );
    }

    server.stop().await;
}

#[tokio::test]
async fn large_message_arrives_whole() {
    let (server, addr, mut events) = start(config("http://127.0.0.1:0/")).await;
    let (mut client, id) = connect_registered(addr, &mut events).await;

    let payload = "x".repeat(10_000);
    client.send(WireMessage::Text(payload.clone().into())).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ServerEvent::message_received(id, payload)
    );

    server.stop().await;
}

#[tokio::test]
async fn oversized_message_ends_the_connection() {
    let (server, addr, mut events) = start(config("http://127.0.0.1:0/")).await;
    let (mut client, id) = connect_registered(addr, &mut events).await;

    let payload = "x".repeat(70_000);
    client.send(WireMessage::Text(payload.into())).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ServerEvent::client_disconnected(id)
    );
    assert_eq!(server.client_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn non_upgrade_request_gets_400() {
    let (server, addr, _events) = start(config("http://127.0.0.1:0/")).await;

    let response = raw_request(
        addr,
        "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert_eq!(server.client_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn request_outside_prefix_gets_404() {
    let (server, addr, _events) = start(config("http://127.0.0.1:0/chat/")).await;

    let response = raw_request(
        addr,
        "GET /other HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    let mut client = connect(addr, "/chat/room").await;
    client.send(WireMessage::Text("hi".into())).await.unwrap();

    server.stop().await;
}

#[tokio::test]
async fn stop_twice_closes_clients_once() {
    let (server, addr, mut events) = start(config("http://127.0.0.1:0/")).await;
    let (mut client, id) = connect_registered(addr, &mut events).await;

    let reader = tokio::spawn(async move {
        let first = next_message(&mut client).await;
        while client.next().await.is_some() {}
        first
    });

    server.stop().await;
    server.stop().await;
    assert_eq!(server.state(), ServerLifecycleState::Stopped);
    assert_eq!(server.client_count(), 0);

    match reader.await.unwrap() {
        WireMessage::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), CloseCode::Normal.as_u16());
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    let mut disconnects = 0;
    while let Ok(event) = events.try_recv() {
        if event == ServerEvent::client_disconnected(id) {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);

    let err = server.start().await.unwrap_err();
    assert!(err.is_lifecycle_error());
}

#[tokio::test]
async fn connection_limit_refuses_extra_clients() {
    let config = config("http://127.0.0.1:0/")
        .to_builder()
        .max_connections(Some(1))
        .build();
    let (server, addr, mut events) = start(config).await;
    let (_first, _) = connect_registered(addr, &mut events).await;

    let mut second = connect(addr, "/").await;
    match next_message(&mut second).await {
        WireMessage::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), CloseCode::TryAgainLater.as_u16());
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(server.client_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn concurrent_clients_are_all_registered_and_removed() {
    let (server, addr, mut events) = start(config("http://127.0.0.1:0/")).await;

    let clients: Vec<Client> = futures_util::future::join_all((0..8).map(|_| connect(addr, "/"))).await;
    for _ in 0..8 {
        assert!(matches!(
            next_event(&mut events).await,
            ServerEvent::ClientConnected { .. }
        ));
    }
    assert_eq!(server.client_count(), 8);

    for mut client in clients {
        client.close(None).await.unwrap();
    }
    for _ in 0..8 {
        assert!(matches!(
            next_event(&mut events).await,
            ServerEvent::ClientDisconnected { .. }
        ));
    }
    assert_eq!(server.client_count(), 0);

    server.stop().await;
}

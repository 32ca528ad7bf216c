//! End-to-end tests: a real server on an ephemeral port, real `WebSocket`
//! clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pulse_core::Event;
use pulse_server::config::ServerConfig;
use pulse_server::errors::TransportError;
use pulse_server::server::PulseServer;
use pulse_server::testutil::RecordingObserver;
use pulse_server::websocket::handlers::{BroadcastHandler, EchoHandler};
use pulse_server::websocket::manager::ClientManager;
use pulse_server::websocket::observer::PumpEvent;
use pulse_server::websocket::router::EventRouter;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    url: String,
    addr: std::net::SocketAddr,
    server: PulseServer,
    observer: Arc<RecordingObserver>,
    handle: JoinHandle<()>,
}

async fn boot(config: ServerConfig) -> TestServer {
    let manager = Arc::new(ClientManager::new());
    let mut router = EventRouter::new();
    router.register("chat", BroadcastHandler::new(manager.clone()));
    router.register("echo", EchoHandler);
    let observer = RecordingObserver::new();
    let server =
        PulseServer::new(config, Arc::new(router), manager).with_observer(observer.clone());
    let (addr, handle) = server.listen().await.unwrap();
    TestServer {
        url: format!("ws://{addr}/ws"),
        addr,
        server,
        observer,
        handle,
    }
}

async fn connect(ts: &TestServer) -> WsStream {
    let expected = ts.server.manager().len() + 1;
    let (ws, _) = timeout(TIMEOUT, connect_async(ts.url.as_str()))
        .await
        .unwrap()
        .unwrap();
    wait_for_clients(ts, expected).await;
    ws
}

async fn wait_for_clients(ts: &TestServer, count: usize) {
    timeout(TIMEOUT, async {
        while ts.server.manager().len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client count never reached");
}

async fn send_event(ws: &mut WsStream, kind: &str, payload: serde_json::Value) {
    let text = Event::new(kind, payload).encode().unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn next_event(ws: &mut WsStream) -> Event {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return Event::decode(text.as_str().as_bytes()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// Read until the server closes. Returns whether a close frame was seen.
async fn wait_for_close(ws: &mut WsStream) -> bool {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("connection never closed") {
            Some(Ok(Message::Close(_))) => return true,
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return false,
        }
    }
}

#[tokio::test]
async fn chat_is_broadcast_to_every_client() {
    let ts = boot(ServerConfig::default()).await;
    let mut alice = connect(&ts).await;
    let mut bob = connect(&ts).await;

    send_event(&mut alice, "chat", json!("hi")).await;

    let expected = Event::new("chat", json!("hi"));
    assert_eq!(next_event(&mut alice).await, expected);
    assert_eq!(next_event(&mut bob).await, expected);
}

#[tokio::test]
async fn echo_returns_to_sender() {
    let ts = boot(ServerConfig::default()).await;
    let mut ws = connect(&ts).await;
    send_event(&mut ws, "echo", json!({"n": 7})).await;
    assert_eq!(next_event(&mut ws).await, Event::new("echo", json!({"n": 7})));
}

#[tokio::test]
async fn unknown_kind_keeps_connection_open() {
    let ts = boot(ServerConfig::default()).await;
    let mut ws = connect(&ts).await;
    send_event(&mut ws, "teleport", json!(null)).await;
    send_event(&mut ws, "echo", json!("still here")).await;
    assert_eq!(next_event(&mut ws).await.payload, json!("still here"));
    assert_eq!(ts.server.manager().len(), 1);
}

#[tokio::test]
async fn malformed_event_closes_connection() {
    let ts = boot(ServerConfig::default()).await;
    let mut ws = connect(&ts).await;
    ws.send(Message::Text("{not json".into())).await.unwrap();
    assert!(wait_for_close(&mut ws).await);
    wait_for_clients(&ts, 0).await;
}

#[tokio::test]
async fn oversized_frame_is_reported_and_not_dispatched() {
    let ts = boot(ServerConfig::default()).await;
    let mut alice = connect(&ts).await;
    let mut bob = connect(&ts).await;

    let big = format!(r#"{{"kind":"chat","payload":"{}"}}"#, "x".repeat(600));
    // The server may drop the socket before the write completes.
    let _ = alice.send(Message::Text(big.into())).await;
    let _ = wait_for_close(&mut alice).await;
    wait_for_clients(&ts, 1).await;

    let events = ts.observer.events();
    assert!(
        events.iter().any(|e| matches!(
            e,
            PumpEvent::ReadFailed(TransportError::MessageTooLarge { limit: 512, .. })
        )),
        "{events:?}"
    );

    // Had the chat been relayed, bob would see it before his echo.
    send_event(&mut bob, "echo", json!("after")).await;
    assert_eq!(next_event(&mut bob).await, Event::new("echo", json!("after")));
}

#[tokio::test]
async fn tcp_reset_is_a_quiet_disconnect() {
    let ts = boot(ServerConfig::default()).await;
    let tcp = tokio::net::TcpStream::connect(ts.addr).await.unwrap();
    let (ws, _) = timeout(TIMEOUT, tokio_tungstenite::client_async(ts.url.as_str(), tcp))
        .await
        .unwrap()
        .unwrap();
    wait_for_clients(&ts, 1).await;

    // Zero linger turns the close into an RST.
    #[allow(deprecated)]
    ws.get_ref().set_linger(Some(Duration::ZERO)).unwrap();
    drop(ws);
    wait_for_clients(&ts, 0).await;

    let events = ts.observer.events();
    assert!(
        events.iter().any(|e| matches!(e, PumpEvent::Disconnected(_))),
        "{events:?}"
    );
    assert!(
        !events.iter().any(|e| matches!(e, PumpEvent::ReadFailed(_))),
        "{events:?}"
    );
}

#[tokio::test]
async fn connection_limit_returns_503() {
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let ts = boot(config).await;
    let _first = connect(&ts).await;

    match connect_async(ts.url.as_str()).await {
        Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status().as_u16(), 503),
        Err(other) => panic!("expected HTTP rejection, got {other:?}"),
        Ok(_) => panic!("second connection should have been refused"),
    }
    assert_eq!(ts.server.manager().len(), 1);
}

#[tokio::test]
async fn health_over_http() {
    let ts = boot(ServerConfig::default()).await;
    let _ws = connect(&ts).await;

    let mut stream = tokio::net::TcpStream::connect(ts.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    let _ = timeout(TIMEOUT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.contains(r#""connections":1"#));
}

#[tokio::test]
async fn shutdown_closes_every_client() {
    let ts = boot(ServerConfig::default()).await;
    let mut alice = connect(&ts).await;
    let mut bob = connect(&ts).await;

    ts.server.shutdown().shutdown();
    assert!(wait_for_close(&mut alice).await);
    assert!(wait_for_close(&mut bob).await);

    assert!(
        ts.server
            .shutdown()
            .graceful_shutdown(vec![ts.handle], Some(TIMEOUT))
            .await
    );
    assert!(ts.server.drain(TIMEOUT).await);
}

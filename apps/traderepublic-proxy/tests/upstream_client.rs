//! Upstream Client Integration Tests
//!
//! Drives the connection manager against a scripted WebSocket server that
//! speaks the upstream text protocol.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use traderepublic_proxy::infrastructure::upstream::HeartbeatConfig;
use traderepublic_proxy::{ConnectionManager, ConnectionState, SubscriptionRequest, UpstreamConfig};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

// =============================================================================
// Mock upstream
// =============================================================================

enum Command {
    Send(String),
    Close,
    Drop,
}

/// One accepted socket. `frames` ends when the socket goes away.
struct MockConnection {
    frames: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedSender<Command>,
}

impl MockConnection {
    async fn next_frame(&mut self) -> String {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection ended")
    }

    /// Read the connect frame, reply `connected`, and return the client info.
    async fn accept_handshake(&mut self) -> Value {
        let frame = self.next_frame().await;
        let info = frame
            .strip_prefix("connect 22 ")
            .unwrap_or_else(|| panic!("expected connect frame, got {frame}"));
        let info = serde_json::from_str(info).unwrap();
        self.send("connected");
        info
    }

    fn send(&self, text: &str) {
        self.commands.send(Command::Send(text.to_string())).unwrap();
    }

    async fn assert_quiet(&mut self) {
        if let Ok(Some(frame)) = timeout(QUIET, self.frames.recv()).await {
            panic!("unexpected frame {frame}");
        }
    }

    async fn closed(&mut self) {
        timeout(WAIT, async { while self.frames.recv().await.is_some() {} })
            .await
            .expect("connection still open");
    }
}

struct MockUpstream {
    url: String,
    connections: mpsc::UnboundedReceiver<MockConnection>,
}

impl MockUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (conn_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (frame_tx, frames) = mpsc::unbounded_channel();
                let (commands, command_rx) = mpsc::unbounded_channel();
                if conn_tx.send(MockConnection { frames, commands }).is_err() {
                    break;
                }
                tokio::spawn(handle_connection(stream, frame_tx, command_rx));
            }
        });

        Self { url, connections }
    }

    async fn next_connection(&mut self) -> MockConnection {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for connection")
            .unwrap()
    }

    async fn assert_no_connection(&mut self) {
        assert!(
            timeout(QUIET, self.connections.recv()).await.is_err(),
            "unexpected connection"
        );
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    frames: mpsc::UnboundedSender<String>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = frames.send(text.as_str().to_string());
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    let _ = write.send(Message::Text(text.into())).await;
                }
                Some(Command::Close) => {
                    let _ = write.send(Message::Close(None)).await;
                }
                // Drop the socket without a close frame.
                Some(Command::Drop) | None => return,
            },
        }
    }
}

/// HTTP proxy that answers CONNECT and reports each request line.
async fn start_connect_proxy() -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (line_tx, lines) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let line_tx = line_tx.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if client.read(&mut byte).await.unwrap_or(0) == 0 {
                        return;
                    }
                    head.push(byte[0]);
                }
                let head = String::from_utf8(head).unwrap();
                let line = head.lines().next().unwrap().to_string();
                let target = line.split_whitespace().nth(1).unwrap().to_string();
                let _ = line_tx.send(line);

                let mut server = TcpStream::connect(target).await.unwrap();
                client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
            });
        }
    });

    (url, lines)
}

fn config(url: &str) -> UpstreamConfig {
    let mut config = UpstreamConfig::new(url);
    config.heartbeat = HeartbeatConfig::new(Duration::from_secs(60), Duration::from_secs(60));
    config.handshake_timeout = Duration::from_secs(2);
    config
}

fn ticker(isin: &str) -> SubscriptionRequest {
    SubscriptionRequest::Ticker {
        id: isin.to_string(),
        exchange: "LSX".to_string(),
    }
}

fn home_exchange(isin: &str) -> SubscriptionRequest {
    SubscriptionRequest::HomeInstrumentExchange {
        id: isin.to_string(),
    }
}

async fn connected(upstream: &mut MockUpstream, manager: &ConnectionManager) -> MockConnection {
    let connect = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    let mut conn = upstream.next_connection().await;
    conn.accept_handshake().await;
    timeout(WAIT, connect).await.unwrap().unwrap().unwrap();
    conn
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn handshake_sends_client_info() {
    let mut upstream = MockUpstream::start().await;
    let manager = ConnectionManager::new(config(&upstream.url));

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });

    let mut conn = upstream.next_connection().await;
    let info = conn.accept_handshake().await;
    assert_eq!(
        info,
        json!({
            "locale": "en",
            "platformId": "undefined",
            "platformVersion": "undefined",
            "clientId": "app.traderepublic.com",
            "clientVersion": "5582"
        })
    );

    assert_eq!(timeout(WAIT, first).await.unwrap().unwrap(), Ok(()));
    assert_eq!(timeout(WAIT, second).await.unwrap().unwrap(), Ok(()));
    assert_eq!(manager.state(), ConnectionState::Connected);
    upstream.assert_no_connection().await;

    manager.shutdown();
}

#[tokio::test]
async fn subscribe_sends_composite_key_and_routes_payloads() {
    let mut upstream = MockUpstream::start().await;
    let manager = ConnectionManager::new(config(&upstream.url));
    let mut conn = connected(&mut upstream, &manager).await;

    let mut apple = manager.subscribe(ticker("US0378331005"));
    assert_eq!(apple.id(), 25);
    assert_eq!(
        conn.next_frame().await,
        r#"sub 25 {"type":"ticker","id":"US0378331005.LSX","exchange":"LSX"}"#
    );

    let mut tesla = manager.subscribe(home_exchange("US88160R1014"));
    assert_eq!(
        conn.next_frame().await,
        r#"sub 26 {"type":"homeInstrumentExchange","id":"US88160R1014"}"#
    );

    conn.send(r#"26 A {"exchangeId":"LSX"}"#);
    conn.send(r#"25 A {"bid":{"price":"182.5"}}"#);
    conn.send(r#"99 A {"bid":{"price":"1"}}"#);

    let payload = timeout(WAIT, apple.next_payload()).await.unwrap();
    assert_eq!(payload, Some(json!({"bid": {"price": "182.5"}})));
    let payload = timeout(WAIT, tesla.next_payload()).await.unwrap();
    assert_eq!(payload, Some(json!({"exchangeId": "LSX"})));

    manager.shutdown();
}

#[tokio::test]
async fn unsubscribe_sends_one_unsub() {
    let mut upstream = MockUpstream::start().await;
    let manager = ConnectionManager::new(config(&upstream.url));
    let mut conn = connected(&mut upstream, &manager).await;

    let mut handle = manager.subscribe(ticker("US0378331005"));
    conn.next_frame().await;

    assert!(handle.unsubscribe());
    assert_eq!(conn.next_frame().await, "unsub 25");

    drop(handle);
    conn.assert_quiet().await;
    assert_eq!(manager.active_count(), 0);

    manager.shutdown();
}

#[tokio::test]
async fn unclean_drop_resubscribes_in_order() {
    let mut upstream = MockUpstream::start().await;
    let manager = ConnectionManager::new(config(&upstream.url));

    // Registered before the handshake: sent by the sweep.
    let _apple = manager.subscribe(ticker("US0378331005"));
    let _tesla = manager.subscribe(home_exchange("US88160R1014"));

    let mut conn = upstream.next_connection().await;
    conn.accept_handshake().await;
    let first_session = [conn.next_frame().await, conn.next_frame().await];
    assert!(first_session[0].starts_with("sub 25 "));
    assert!(first_session[1].starts_with("sub 26 "));
    conn.assert_quiet().await;

    conn.commands.send(Command::Drop).unwrap();

    let mut conn = upstream.next_connection().await;
    conn.accept_handshake().await;
    let second_session = [conn.next_frame().await, conn.next_frame().await];
    assert_eq!(second_session, first_session);
    conn.assert_quiet().await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    manager.shutdown();
}

#[tokio::test]
async fn clean_close_does_not_reconnect() {
    let mut upstream = MockUpstream::start().await;
    let manager = ConnectionManager::new(config(&upstream.url));
    let mut conn = connected(&mut upstream, &manager).await;

    let _handle = manager.subscribe(ticker("US0378331005"));
    conn.next_frame().await;

    conn.commands.send(Command::Close).unwrap();
    conn.closed().await;

    upstream.assert_no_connection().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    manager.shutdown();
}

#[tokio::test]
async fn idle_connection_is_released() {
    let mut upstream = MockUpstream::start().await;
    let mut config = config(&upstream.url);
    config.heartbeat = HeartbeatConfig::new(Duration::from_secs(60), Duration::from_millis(200));
    let manager = ConnectionManager::new(config);

    let handle = manager.subscribe(ticker("US0378331005"));
    let mut conn = upstream.next_connection().await;
    conn.accept_handshake().await;
    assert!(conn.next_frame().await.starts_with("sub 25 "));

    drop(handle);
    assert_eq!(conn.next_frame().await, "unsub 25");
    conn.closed().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    upstream.assert_no_connection().await;

    // A new subscription opens a fresh session with a reset counter.
    let _handle = manager.subscribe(home_exchange("US0378331005"));
    let mut conn = upstream.next_connection().await;
    conn.accept_handshake().await;
    assert!(conn.next_frame().await.starts_with("sub 25 "));

    manager.shutdown();
}

#[tokio::test]
async fn echo_frames_sent_while_connected() {
    let mut upstream = MockUpstream::start().await;
    let mut config = config(&upstream.url);
    config.heartbeat = HeartbeatConfig::new(Duration::from_millis(100), Duration::from_secs(60));
    let manager = ConnectionManager::new(config);
    let mut conn = connected(&mut upstream, &manager).await;

    let frame = conn.next_frame().await;
    let seconds = frame.strip_prefix("echo ").expect("echo frame");
    assert!(seconds.parse::<u64>().unwrap() > 1_600_000_000);

    manager.shutdown();
}

#[tokio::test]
async fn handshake_tunnels_through_http_proxy() {
    let mut upstream = MockUpstream::start().await;
    let (proxy, mut requests) = start_connect_proxy().await;
    let mut config = config(&upstream.url);
    config.proxy = Some(proxy);
    let manager = ConnectionManager::new(config);

    let mut conn = connected(&mut upstream, &manager).await;
    let authority = upstream.url.trim_start_matches("ws://");
    let line = timeout(WAIT, requests.recv()).await.unwrap().unwrap();
    assert_eq!(line, format!("CONNECT {authority} HTTP/1.1"));

    let _handle = manager.subscribe(ticker("US0378331005"));
    assert!(conn.next_frame().await.starts_with("sub 25 "));
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.shutdown();
}

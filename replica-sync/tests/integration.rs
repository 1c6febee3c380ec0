//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server and connect real clients,
//! verifying the full request/push pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use replica_sync::client::{ClientConfig, ConnectionState, SyncClient};
use replica_sync::directory::{Directory, DirectoryConfig};
use replica_sync::hub::Hub;
use replica_sync::protocol::{MessageType, SyncMessage};
use replica_sync::server::{ServerConfig, SyncServer};
use replica_sync::transport::{ConnectionEvent, Push, Transport, TransportError};
use serde_json::json;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Start a server on a free port, return the port and its hub.
async fn start_test_server() -> (u16, Arc<Hub>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        debounce_ms: 0,
        orphan_grace_secs: None,
        heartbeat_interval_secs: 30,
    };
    let server = SyncServer::new(config);
    let hub = server.hub().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (port, hub)
}

async fn connected_client(port: u16, topic: &str) -> Arc<SyncClient> {
    let client = SyncClient::new(topic, format!("ws://127.0.0.1:{port}"), ClientConfig::default());
    client.connect().await.expect("client should connect");
    Arc::new(client)
}

fn record(client: &SyncClient, id: &str) -> Arc<Mutex<Vec<Push>>> {
    let seen: Arc<Mutex<Vec<Push>>> = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    client.listen(id, Arc::new(move |push: Push| s.lock().push(push)));
    seen
}

/// Poll `condition` until it holds or two seconds pass.
async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, _) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    // Connect raw WebSocket
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects_and_reports_event() {
    let (port, _) = start_test_server().await;
    let client = SyncClient::new("game", format!("ws://127.0.0.1:{port}"), ClientConfig::default());
    let mut event_rx = client.take_event_rx().unwrap();

    assert!(client.connect().await.is_ok(), "Client should connect");

    let event = timeout(Duration::from_secs(2), event_rx.recv()).await;
    match event {
        Ok(Some(ConnectionEvent::Connected)) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_request_before_subscribe_is_rejected() {
    let (port, _) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    let request = SyncMessage::read(Uuid::new_v4(), 9, "game", "x");
    ws.send(Message::Binary(request.encode().unwrap().into())).await.unwrap();

    let reply = loop {
        match timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                break SyncMessage::decode(&bytes).unwrap();
            }
            Some(Ok(_)) => continue,
            other => panic!("Expected a reply, got {other:?}"),
        }
    };
    assert_eq!(reply.msg_type, MessageType::Error);
    assert_eq!(reply.request_id, 9);
    assert_eq!(reply.error_message().unwrap(), "not subscribed");
}

#[tokio::test]
async fn test_update_read_remove_roundtrip() {
    let (port, hub) = start_test_server().await;
    let client = connected_client(port, "game").await;

    client.update("piece-1", json!({"row": 2})).await.unwrap();
    assert_eq!(client.read("piece-1").await.unwrap(), Some(json!({"row": 2})));
    assert_eq!(hub.read("game", "piece-1"), Some(json!({"row": 2})));

    client.remove("piece-1").await.unwrap();
    assert_eq!(client.read("piece-1").await.unwrap(), None);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_pushes_reach_other_clients_only() {
    let (port, _) = start_test_server().await;
    let alice = connected_client(port, "game").await;
    let bob = connected_client(port, "game").await;
    let carol = connected_client(port, "other").await;

    let alice_seen = record(&alice, "x");
    let bob_seen = record(&bob, "x");
    let carol_seen = record(&carol, "x");

    alice.update("x", json!(1)).await.unwrap();
    alice.remove("x").await.unwrap();

    assert!(wait_until(|| bob_seen.lock().len() == 2).await);
    assert_eq!(
        *bob_seen.lock(),
        vec![Push::update("x", json!(1)), Push::remove("x")]
    );

    // Round trip so any stray echo would have arrived
    alice.ping().await.unwrap();
    assert!(alice_seen.lock().is_empty());
    assert!(carol_seen.lock().is_empty());
}

#[tokio::test]
async fn test_ping_round_trip() {
    let (port, _) = start_test_server().await;
    let client = connected_client(port, "game").await;
    let rtt = client.ping().await.unwrap();
    assert!(rtt < Duration::from_secs(2));
}

#[tokio::test]
async fn test_disconnect_fails_requests() {
    let (port, _) = start_test_server().await;
    let client = connected_client(port, "game").await;
    let mut event_rx = client.take_event_rx().unwrap();
    assert_eq!(event_rx.recv().await, Some(ConnectionEvent::Connected));

    client.disconnect().await;
    assert_eq!(event_rx.recv().await, Some(ConnectionEvent::Disconnected));
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert!(matches!(
        client.update("x", json!(1)).await,
        Err(TransportError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_maintain_connects() {
    let (port, _) = start_test_server().await;
    let client = Arc::new(SyncClient::new(
        "game",
        format!("ws://127.0.0.1:{port}"),
        ClientConfig {
            reconnect_delay: Duration::from_millis(20),
            ..ClientConfig::default()
        },
    ));
    let cancel = CancellationToken::new();
    let task = client.clone().maintain(cancel.clone());

    let deadline = Instant::now() + Duration::from_secs(2);
    while client.connection_state().await != ConnectionState::Connected {
        assert!(Instant::now() < deadline, "client never connected");
        sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    task.await.unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_directories_converge_over_websocket() {
    let (port, hub) = start_test_server().await;
    let alice = Directory::new(connected_client(port, "board").await, DirectoryConfig::default());
    let bob = Directory::new(connected_client(port, "board").await, DirectoryConfig::default());

    alice.create("piece-1", json!({"row": 0}));
    assert!(wait_until(|| bob.is_bound("piece-1")).await);
    bob.create("piece-2", json!({"row": 7}));

    let cancel = CancellationToken::new();
    let snapshot = timeout(
        Duration::from_secs(5),
        alice.ensure_all_observable_ids(|s| s.len() == 2, &cancel),
    )
    .await
    .expect("directory never converged")
    .unwrap();
    assert_eq!(snapshot.get("piece-2"), Some(&json!({"row": 7})));

    assert!(wait_until(|| bob.get("piece-1") == Some(json!({"row": 0}))).await);

    bob.set("piece-1", json!({"row": 1}));
    assert!(wait_until(|| alice.get("piece-1") == Some(json!({"row": 1}))).await);
    assert_eq!(hub.read("board", "piece-1"), Some(json!({"row": 1})));

    alice.remove_observable_for_id("piece-2");
    assert!(wait_until(|| !bob.is_bound("piece-2")).await);
    assert_eq!(bob.directory_ids(), vec!["piece-1".to_string()]);
}

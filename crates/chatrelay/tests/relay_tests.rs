//! Relay lifecycle tests over in-process transports.

use std::sync::Arc;
use std::time::Duration;

use chatrelay::config::RelayConfig;
use chatrelay::protocol::{Message, NewMessage};
use chatrelay::ws::memory::{self, MemoryPeer};
use chatrelay::ws::{
    BackendTransport, ClientTransport, DuplicateSessionPolicy, OverflowPolicy, ServerFrame,
    TransportError, WsHub, run_session,
};
use serde_json::Value;
use tokio::task::JoinHandle;

type ClientPeer = MemoryPeer<String, ServerFrame>;
type BackendPeer = MemoryPeer<Message, NewMessage>;

const DEADLINE: Duration = Duration::from_secs(5);

struct Connection {
    client: ClientPeer,
    backend: BackendPeer,
    task: JoinHandle<()>,
}

fn connect(hub: &WsHub, config: RelayConfig, username: &str, client_capacity: usize) -> Connection {
    let (client, client_peer) = memory::pair::<String, ServerFrame>(client_capacity);
    let (backend, backend_peer) = memory::pair::<Message, NewMessage>(64);
    let client: Arc<ClientTransport> = Arc::new(client);
    let backend: Arc<BackendTransport> = Arc::new(backend);

    let hub = hub.clone();
    let username = username.to_string();
    let task = tokio::spawn(async move {
        run_session(&hub, config, username, "general".to_string(), client, backend).await;
    });

    Connection {
        client: client_peer,
        backend: backend_peer,
        task,
    }
}

async fn wait_live(hub: &WsHub, count: usize) {
    let mut live = hub.watch_live_sessions();
    tokio::time::timeout(DEADLINE, live.wait_for(|n| *n == count))
        .await
        .unwrap_or_else(|_| panic!("expected {count} live session(s)"))
        .unwrap();
}

async fn finished(task: JoinHandle<()>) {
    tokio::time::timeout(DEADLINE, task)
        .await
        .expect("session finishes")
        .expect("session task does not panic");
}

fn message(content: &str) -> Message {
    Message::new("bob", content)
}

fn content_of(frame: &str) -> String {
    let json: Value = serde_json::from_str(frame).unwrap();
    json["content"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_client_message_reaches_backend_and_back() {
    let hub = WsHub::spawn(DuplicateSessionPolicy::Allow);
    let mut conn = connect(&hub, RelayConfig::default(), "alice", 16);
    wait_live(&hub, 1).await;

    conn.client.send(r#"{"content":"<p>hi</p>"}"#.to_string());
    let forwarded = tokio::time::timeout(DEADLINE, conn.backend.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded.username, "alice");
    assert_eq!(forwarded.content, "hi");

    conn.backend.send(Message::new("alice", "hi"));
    let frame = conn.client.recv_text().await.unwrap();
    let json: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(json["username"], "alice");
    assert_eq!(json["content"], "hi");
    assert!(json["creationDate"].is_string());

    hub.shutdown().await;
    finished(conn.task).await;
}

#[tokio::test]
async fn test_backend_failure_closes_client() {
    let hub = WsHub::spawn(DuplicateSessionPolicy::Allow);
    let mut conn = connect(&hub, RelayConfig::default(), "alice", 16);
    wait_live(&hub, 1).await;

    conn.backend.fail(TransportError::Io("stream reset".to_string()));

    tokio::time::timeout(DEADLINE, conn.client.closed())
        .await
        .expect("client closed after backend failure");
    assert!(conn.backend.is_closed());
    wait_live(&hub, 0).await;
    finished(conn.task).await;
}

#[tokio::test]
async fn test_client_read_failure_tears_down_once() {
    let hub = WsHub::spawn(DuplicateSessionPolicy::Allow);
    let mut conn = connect(&hub, RelayConfig::default(), "alice", 16);
    wait_live(&hub, 1).await;

    conn.client.fail(TransportError::Timeout);

    tokio::time::timeout(DEADLINE, conn.backend.closed())
        .await
        .expect("backend closed after client failure");
    assert!(conn.client.is_closed());
    finished(conn.task).await;
    assert_eq!(hub.live_sessions(), 0);

    // Nothing is left for shutdown to close.
    assert_eq!(hub.shutdown().await, 0);
}

#[tokio::test]
async fn test_malformed_frame_reports_then_closes() {
    let hub = WsHub::spawn(DuplicateSessionPolicy::Allow);
    let mut conn = connect(&hub, RelayConfig::default(), "alice", 16);
    wait_live(&hub, 1).await;

    conn.client.send("{not json".to_string());
    assert_eq!(
        conn.client.recv_text().await.as_deref(),
        Some(r#"{"error":"INVALID_FRAME"}"#)
    );
    assert_eq!(conn.client.recv_text().await, None);

    finished(conn.task).await;
    assert!(conn.backend.is_closed());
    assert_eq!(hub.live_sessions(), 0);
}

#[tokio::test]
async fn test_many_connections_register_and_release() {
    let hub = WsHub::spawn(DuplicateSessionPolicy::Allow);
    let connections: Vec<Connection> = (0..50)
        .map(|i| connect(&hub, RelayConfig::default(), &format!("user{i}"), 16))
        .collect();
    wait_live(&hub, 50).await;

    let mut tasks = Vec::new();
    for (i, conn) in connections.into_iter().enumerate() {
        if i % 2 == 0 {
            conn.client.fail(TransportError::Closed);
        } else {
            conn.backend.fail(TransportError::Closed);
        }
        tasks.push((conn.task, conn.client, conn.backend));
    }

    for (task, client, backend) in tasks {
        finished(task).await;
        assert!(client.is_closed());
        assert!(backend.is_closed());
    }
    wait_live(&hub, 0).await;
}

#[tokio::test]
async fn test_slow_client_drops_newest_and_keeps_session() {
    let config = RelayConfig {
        queue_capacity: 4,
        ..RelayConfig::default()
    };
    let hub = WsHub::spawn(DuplicateSessionPolicy::Allow);
    // The client buffers one frame and reads nothing until the burst is over.
    let mut conn = connect(&hub, config, "alice", 1);
    wait_live(&hub, 1).await;

    for i in 0..50 {
        conn.backend.send(message(&format!("burst {i}")));
    }

    // At most one frame in the client buffer, one held by the writer and
    // four in the queue survive the burst.
    let mut received = Vec::new();
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(200), conn.client.recv_text()).await
    {
        received.push(content_of(&frame));
    }
    assert!(received.len() <= 6, "received {} frames", received.len());
    assert_eq!(received.first().map(String::as_str), Some("burst 0"));

    conn.backend.send(message("after"));
    let next = conn.client.recv_text().await.unwrap();
    assert_eq!(content_of(&next), "after");
    assert!(!conn.client.is_closed());

    hub.shutdown().await;
    finished(conn.task).await;
}

#[tokio::test]
async fn test_slow_client_disconnect_policy() {
    let config = RelayConfig {
        queue_capacity: 2,
        overflow_policy: OverflowPolicy::Disconnect,
        ..RelayConfig::default()
    };
    let hub = WsHub::spawn(DuplicateSessionPolicy::Allow);
    let mut conn = connect(&hub, config, "alice", 1);
    wait_live(&hub, 1).await;

    for i in 0..20 {
        conn.backend.send(message(&format!("burst {i}")));
    }

    tokio::time::timeout(DEADLINE, conn.backend.closed())
        .await
        .expect("slow consumer disconnected");
    finished(conn.task).await;
    assert_eq!(hub.live_sessions(), 0);
}

#[tokio::test]
async fn test_shutdown_closes_every_session() {
    let hub = WsHub::spawn(DuplicateSessionPolicy::Allow);
    let connections: Vec<Connection> = (0..5)
        .map(|i| connect(&hub, RelayConfig::default(), &format!("user{i}"), 16))
        .collect();
    wait_live(&hub, 5).await;

    assert_eq!(hub.shutdown().await, 5);
    assert_eq!(hub.live_sessions(), 0);

    for conn in connections {
        assert!(conn.client.is_closed());
        assert!(conn.backend.is_closed());
        finished(conn.task).await;
    }

    // Registering after shutdown is refused and the transports released.
    let conn = connect(&hub, RelayConfig::default(), "late", 16);
    finished(conn.task).await;
    assert!(conn.client.is_closed());
    assert!(conn.backend.is_closed());
}

#[tokio::test]
async fn test_duplicate_session_rejected_when_configured() {
    let hub = WsHub::spawn(DuplicateSessionPolicy::Reject);
    let first = connect(&hub, RelayConfig::default(), "alice", 16);
    wait_live(&hub, 1).await;

    let mut second = connect(&hub, RelayConfig::default(), "alice", 16);
    assert_eq!(
        second.client.recv_text().await.as_deref(),
        Some(r#"{"error":"SESSION_ALREADY_OPEN"}"#)
    );
    finished(second.task).await;
    assert!(second.backend.is_closed());
    assert_eq!(hub.live_sessions(), 1);
    assert!(!first.client.is_closed());

    hub.shutdown().await;
    finished(first.task).await;
}

#[tokio::test]
async fn test_duplicate_sessions_allowed_by_default() {
    let hub = WsHub::spawn(DuplicateSessionPolicy::default());
    let first = connect(&hub, RelayConfig::default(), "alice", 16);
    let second = connect(&hub, RelayConfig::default(), "alice", 16);
    wait_live(&hub, 2).await;

    hub.shutdown().await;
    finished(first.task).await;
    finished(second.task).await;
}

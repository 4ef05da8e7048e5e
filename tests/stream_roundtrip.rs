//! End-to-end tests: the HTTP transport against the development stream
//! server over a real socket.

use ratefeed::config::StreamConfig;
use ratefeed::devserver::{router, StreamHub};
use ratefeed::realtime::{
    BackoffPolicy, ConnectionEvent, ConnectionState, EventKind, EventPayload, Handler,
    HttpTransport, RatesUpdatedPayload, RealtimeClient, TransportError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> (Arc<StreamHub>, SocketAddr) {
    let hub = Arc::new(StreamHub::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = router(Arc::clone(&hub), "/api");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (hub, addr)
}

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy::new(
        Duration::from_millis(20),
        1.5,
        Duration::from_millis(100),
    )
}

fn client_for(api_base: String, events_path: &str) -> RealtimeClient {
    let config = StreamConfig {
        api_base,
        events_path: events_path.to_string(),
        connect_timeout_secs: 2,
        ..StreamConfig::default()
    };
    let transport = HttpTransport::new(&config).unwrap();
    RealtimeClient::new(Arc::new(transport), fast_policy())
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Wait for the server to drop closed clients; it only notices on write
async fn wait_for_clients(hub: &StreamHub, expected: usize) {
    timeout(WAIT, async {
        while hub.connection_count() != expected {
            let _ = hub.broadcast(&EventKind::Other("ping".to_string()), &serde_json::json!({}));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client count not reached in time");
}

#[tokio::test]
async fn test_connect_receive_and_disconnect() {
    let (hub, addr) = start_server().await;
    let client = client_for(format!("http://{}/api", addr), "/events");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let rates = Handler::new("rates", move |payload: &EventPayload| {
        let _ = tx.send(payload.clone());
        Ok(())
    });
    client.on(EventKind::RatesUpdated, &rates);

    client.enable().await;
    let mut connected = client.watch_connected();
    timeout(WAIT, connected.wait_for(|c| *c))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.state().await, ConnectionState::Open);

    // The `connected` event follows the open
    wait_until(|| client.client_id().is_some()).await;
    assert_eq!(hub.connection_count(), 1);

    let sent = RatesUpdatedPayload {
        timestamp: "2024-05-01T08:00:00+00:00".to_string(),
        source: "CMB".to_string(),
        count: 9,
    };
    assert_eq!(hub.broadcast(&EventKind::RatesUpdated, &sent).unwrap(), 1);

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, EventPayload::RatesUpdated(sent));

    client.disable().await;
    assert!(!client.is_connected());
    wait_for_clients(&hub, 0).await;
}

#[tokio::test]
async fn test_unreachable_server_keeps_retrying() {
    // Reserve a port, then free it so nothing is listening there
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let client = client_for(format!("http://{}/api", addr), "/events");
    let mut events = client.events();

    client.enable().await;

    let mut attempts = Vec::new();
    while attempts.len() < 3 {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let ConnectionEvent::Disconnected { attempt, error, .. } = event {
            assert!(matches!(error, TransportError::Connect(_)), "{:?}", error);
            attempts.push(attempt);
        }
    }
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(!client.is_connected());

    client.disable().await;
    assert_eq!(client.state().await, ConnectionState::Closed);
}

#[tokio::test]
async fn test_non_stream_response_is_retried() {
    let (_hub, addr) = start_server().await;
    // `/health` answers with JSON, not an event stream
    let client = client_for(format!("http://{}", addr), "/health");
    let mut events = client.events();

    client.enable().await;

    let error = loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let ConnectionEvent::Disconnected { error, .. } = event {
            break error;
        }
    };
    assert!(
        matches!(&error, TransportError::ContentType(ct) if ct.starts_with("application/json")),
        "{:?}",
        error
    );

    client.disable().await;
}

#[tokio::test]
async fn test_manual_reconnect_recovers_immediately() {
    let (hub, addr) = start_server().await;
    let config = StreamConfig {
        api_base: format!("http://{}/api", addr),
        ..StreamConfig::default()
    };
    let transport = HttpTransport::new(&config).unwrap();
    // Long backoff: only a manual reconnect can bring the stream back quickly
    let client = RealtimeClient::new(
        Arc::new(transport),
        BackoffPolicy::new(Duration::from_secs(60), 1.5, Duration::from_secs(60)),
    );

    client.enable().await;
    let mut connected = client.watch_connected();
    timeout(WAIT, connected.wait_for(|c| *c))
        .await
        .unwrap()
        .unwrap();
    wait_until(|| client.client_id().is_some()).await;
    let first_session = client.client_id();

    assert!(client.reconnect().await);
    timeout(WAIT, connected.wait_for(|c| *c))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.state().await, ConnectionState::Open);
    wait_until(|| client.client_id().is_some() && client.client_id() != first_session).await;

    // The replaced stream is released by the server
    wait_for_clients(&hub, 1).await;
    client.disable().await;
}

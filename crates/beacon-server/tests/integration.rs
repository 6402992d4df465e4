//! End-to-end tests driving the server over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use beacon_hub::Hub;
use beacon_server::config::ServerConfig;
use beacon_server::server::{self, ServerHandle};
use beacon_server::shutdown::ShutdownCoordinator;

const TIMEOUT: Duration = Duration::from_secs(5);

const ADDR_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const ADDR_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const ADDR_C: &str = "0xcccccccccccccccccccccccccccccccccccccccc";

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0, // auto-assign
        ..ServerConfig::default()
    }
}

/// Boot a test server and return its base URL, the hub handle, and the
/// server handle.
async fn boot(config: ServerConfig) -> (String, Hub, ServerHandle) {
    let hub = Hub::spawn(config.hub_config());
    let metrics = PrometheusBuilder::new().build_recorder().handle();
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let handle = server::start(&config, hub.clone(), metrics, shutdown)
        .await
        .unwrap();
    let base = handle.local_addr.to_string();
    (base, hub, handle)
}

async fn connect(base: &str, address: &str) -> WsStream {
    let (ws, _resp) = connect_async(format!("ws://{base}/ws/{address}"))
        .await
        .expect("websocket connect failed");
    ws
}

/// Next text frame parsed as JSON; skips control frames.
async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Assert the server closes this connection (close frame, clean end of
/// stream, or reset) without delivering any further text frames.
async fn expect_closed(ws: &mut WsStream) {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("connection not closed in time") {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Text(text))) => panic!("unexpected frame after eviction: {text}"),
            Some(Ok(_)) => {}
        }
    }
}

/// Poll until the registry holds exactly `count` sessions.
async fn wait_for_count(hub: &Hub, count: usize) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if hub.stats().await.connected_clients == count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry never reached {count} sessions"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn welcome_message_on_connect() {
    let (base, _hub, _handle) = boot(test_config()).await;
    let mut ws = connect(&base, ADDR_A).await;

    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "connected");
    assert_eq!(msg["data"]["address"], ADDR_A);
    assert_eq!(msg["data"]["status"], "connected");
    let ts = msg["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
}

#[tokio::test]
async fn address_is_normalized_to_lowercase() {
    let (base, hub, _handle) = boot(test_config()).await;
    let checksummed = "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    let mut ws = connect(&base, checksummed).await;

    let msg = next_json(&mut ws).await;
    assert_eq!(msg["data"]["address"], ADDR_A);

    let stats = hub.stats().await;
    assert_eq!(stats.connected_users[0].as_str(), ADDR_A);
}

#[tokio::test]
async fn invalid_address_is_rejected() {
    let (base, _hub, _handle) = boot(test_config()).await;
    let result = connect_async(format!("ws://{base}/ws/not-a-wallet")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn ping_pong() {
    let (base, _hub, _handle) = boot(test_config()).await;
    let mut ws = connect(&base, ADDR_A).await;
    let _ = next_json(&mut ws).await; // welcome

    ws.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();

    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["data"]["status"], "ok");
}

#[tokio::test]
async fn garbage_and_unknown_frames_are_ignored() {
    let (base, _hub, _handle) = boot(test_config()).await;
    let mut ws = connect(&base, ADDR_A).await;
    let _ = next_json(&mut ws).await; // welcome

    ws.send(Message::text("not valid json")).await.unwrap();
    ws.send(Message::text(r#"{"type":"mystery"}"#)).await.unwrap();
    ws.send(Message::text(r#"{"type":"subscribe","events":["mint"]}"#))
        .await
        .unwrap();
    ws.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();

    // The only reply is the pong for the final ping.
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "pong");
}

#[tokio::test]
async fn notify_user_reaches_only_the_target() {
    let (base, hub, _handle) = boot(test_config()).await;
    let mut ws_a = connect(&base, ADDR_A).await;
    let mut ws_b = connect(&base, ADDR_B).await;
    let _ = next_json(&mut ws_a).await;
    let _ = next_json(&mut ws_b).await;

    hub.notify_user(ADDR_A, "PACK_OPENED", json!({ "pack_id": 7 }))
        .await;

    let msg = next_json(&mut ws_a).await;
    assert_eq!(msg["type"], "PACK_OPENED");
    assert_eq!(msg["data"]["pack_id"], 7);

    // The other client hears nothing.
    let silent = timeout(Duration::from_millis(200), ws_b.next()).await;
    assert!(silent.is_err());
}

#[tokio::test]
async fn notify_absent_user_is_a_silent_noop() {
    let (base, hub, _handle) = boot(test_config()).await;
    let mut ws_a = connect(&base, ADDR_A).await;
    let _ = next_json(&mut ws_a).await;

    hub.notify_user(ADDR_B, "PACK_OPENED", json!({})).await;

    let stats = hub.stats().await;
    assert_eq!(stats.connected_clients, 1);
    assert_eq!(stats.connected_users[0].as_str(), ADDR_A);
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let (base, hub, _handle) = boot(test_config()).await;
    let mut sockets = Vec::new();
    for addr in [ADDR_A, ADDR_B, ADDR_C] {
        let mut ws = connect(&base, addr).await;
        let _ = next_json(&mut ws).await;
        sockets.push(ws);
    }

    hub.broadcast_to_all("PRICE_UPDATE", json!({ "pair": "ETH/USD", "price": "3100.42" }))
        .await;

    for ws in &mut sockets {
        let msg = next_json(ws).await;
        assert_eq!(msg["type"], "PRICE_UPDATE");
        assert_eq!(msg["data"]["pair"], "ETH/USD");
    }
}

#[tokio::test]
async fn reconnect_displaces_previous_session() {
    let (base, hub, _handle) = boot(test_config()).await;
    let mut ws1 = connect(&base, ADDR_A).await;
    let _ = next_json(&mut ws1).await;

    let mut ws2 = connect(&base, ADDR_A).await;
    let _ = next_json(&mut ws2).await;

    // The first transport is closed; the registry maps the address to
    // the new session only.
    expect_closed(&mut ws1).await;
    let stats = hub.stats().await;
    assert_eq!(stats.connected_clients, 1);

    // The replacement is still live.
    ws2.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
    assert_eq!(next_json(&mut ws2).await["type"], "pong");
}

#[tokio::test]
async fn stats_lists_addresses_sorted() {
    let (base, hub, _handle) = boot(test_config()).await;
    // Connect out of order; each welcome confirms registration.
    let mut sockets = Vec::new();
    for addr in [ADDR_C, ADDR_A, ADDR_B] {
        let mut ws = connect(&base, addr).await;
        let _ = next_json(&mut ws).await;
        sockets.push(ws);
    }

    let stats = hub.stats().await;
    assert_eq!(stats.connected_clients, 3);
    let users: Vec<&str> = stats
        .connected_users
        .iter()
        .map(beacon_hub::Address::as_str)
        .collect();
    assert_eq!(users, vec![ADDR_A, ADDR_B, ADDR_C]);
}

#[tokio::test]
async fn idle_connection_is_reclaimed() {
    let config = ServerConfig {
        idle_timeout_secs: 1,
        ping_interval_secs: 120, // no pings during the test window
        ..test_config()
    };
    let (base, hub, _handle) = boot(config).await;
    let mut ws = connect(&base, ADDR_A).await;
    let _ = next_json(&mut ws).await;
    wait_for_count(&hub, 1).await;

    // Send nothing and answer nothing; the read deadline fires.
    expect_closed(&mut ws).await;
    wait_for_count(&hub, 0).await;
}

#[tokio::test]
async fn disconnect_removes_session_from_stats() {
    let (base, hub, _handle) = boot(test_config()).await;
    let mut ws = connect(&base, ADDR_A).await;
    let _ = next_json(&mut ws).await;
    wait_for_count(&hub, 1).await;

    ws.close(None).await.unwrap();
    wait_for_count(&hub, 0).await;
}

#[tokio::test]
async fn health_and_stats_endpoints() {
    let (base, _hub, _handle) = boot(test_config()).await;
    let mut ws = connect(&base, ADDR_A).await;
    let _ = next_json(&mut ws).await;

    let health: Value = reqwest::get(format!("http://{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);

    let stats: Value = reqwest::get(format!("http://{base}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["connected_clients"], 1);
    assert_eq!(stats["connected_users"][0], ADDR_A);
}

#[tokio::test]
async fn server_shuts_down_on_drain() {
    let config = test_config();
    let hub = Hub::spawn(config.hub_config());
    let metrics = PrometheusBuilder::new().build_recorder().handle();
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let handle = server::start(&config, hub, metrics, Arc::clone(&shutdown))
        .await
        .unwrap();

    shutdown.drain(vec![handle.task], TIMEOUT).await;
    assert!(shutdown.is_shutting_down());
}

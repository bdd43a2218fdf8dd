//! End-to-end signaling over a real WebSocket connection.
//!
//! Starts `SignalingServer` on an ephemeral loopback port and talks to it
//! with a tokio-tungstenite client, using in-memory transport and capture
//! doubles behind the registry.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mirror_core::AttachPolicy;
use mirror_device::domain::ServerConfig;
use mirror_device::infrastructure::SignalingServer;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use common::harness;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(5);

fn loopback_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        bind_retry_ms: 50,
        rebind_delay_ms: 10,
        shutdown_grace_ms: 1000,
    }
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = timeout(STEP, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("WebSocket error");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).expect("valid JSON");
        }
    }
}

async fn send(client: &mut Client, text: &str) {
    client
        .send(WsMessage::Text(text.to_string()))
        .await
        .expect("send");
}

#[tokio::test]
async fn test_device_info_ping_and_offer_over_websocket() {
    // Arrange
    let h = harness(AttachPolicy::FanOut);
    let server = SignalingServer::new(&loopback_config(), h.registry.clone()).unwrap();
    server.start().await;
    let addr = timeout(STEP, server.wait_bound())
        .await
        .expect("server never bound")
        .expect("bound address");
    let (mut client, _) = connect_async(format!("ws://{addr}")).await.expect("connect");

    // Act / Assert: greeting
    let greeting = next_json(&mut client).await;
    assert_eq!(greeting["type"], "device_info");
    assert_eq!(greeting["device_name"], "test-device");
    assert_eq!(greeting["device_id"], "device-0001");

    // Act / Assert: garbage is ignored, ping is answered
    send(&mut client, "{not json").await;
    send(&mut client, r#"{"type":"teleport"}"#).await;
    send(&mut client, r#"{"type":"ping"}"#).await;
    assert_eq!(next_json(&mut client).await["type"], "device_info");

    // Act / Assert: negotiation produces exactly one offer
    send(&mut client, r#"{"type":"start_webrtc"}"#).await;
    let offer = next_json(&mut client).await;
    assert_eq!(offer["type"], "offer");
    assert!(offer["sdp"].as_str().unwrap().contains("sendonly"));

    // Cleanup
    client.close(None).await.ok();
    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_removes_session() {
    // Arrange
    let h = harness(AttachPolicy::FanOut);
    let server = SignalingServer::new(&loopback_config(), h.registry.clone()).unwrap();
    server.start().await;
    let addr = timeout(STEP, server.wait_bound()).await.unwrap().unwrap();
    let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    next_json(&mut client).await;
    assert_eq!(h.registry.session_count().await, 1);

    // Act
    client.close(None).await.ok();
    drop(client);

    // Assert
    let drained = timeout(STEP, async {
        while h.registry.session_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "session was not removed after disconnect");
    server.stop().await;
}

#[tokio::test]
async fn test_restart_rebinds_and_accepts_again() {
    // Arrange
    let h = harness(AttachPolicy::FanOut);
    let server = SignalingServer::new(&loopback_config(), h.registry.clone()).unwrap();
    server.start().await;
    timeout(STEP, server.wait_bound()).await.unwrap().unwrap();

    // Act
    server.start().await;
    let addr = timeout(STEP, server.wait_bound()).await.unwrap().unwrap();
    let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();

    // Assert
    assert_eq!(next_json(&mut client).await["type"], "device_info");
    assert!(server.is_running().await);

    server.stop().await;
    assert!(!server.is_running().await);
}

//! Integration test: WebSocket clients on /cb/websocket receive envelopes posted to /emit,
//! and are disconnected when the server shuts down.

use fanout::config::Config;
use fanout::gateway;
use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

async fn wait_for_connections(port: u16, want: u64) {
    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(resp) = client.get(&url).send().await {
            if let Ok(json) = resp.json::<serde_json::Value>().await {
                if json.get("connections").and_then(|v| v.as_u64()) == Some(want) {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server did not report {} connection(s) within 5s", want);
}

async fn connect(port: u16) -> Client {
    let url = format!("ws://127.0.0.1:{}/cb/websocket", port);
    for _ in 0..100 {
        if let Ok((ws, _)) = tokio_tungstenite::connect_async(&url).await {
            return ws;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("could not connect to {}", url);
}

async fn next_text(ws: &mut Client) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read frame");
        if let Message::Text(text) = frame {
            return text;
        }
    }
}

/// True once the server has closed the socket (close frame, error, or end of stream).
async fn closed_by_server(ws: &mut Client) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

#[tokio::test]
async fn emit_reaches_every_client_and_shutdown_disconnects_them() {
    let port = free_port();
    let mut config = Config::default();
    config.server.port = port;
    config.server.bind = "127.0.0.1".to_string();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        gateway::run_server_with_shutdown(config, async move {
            let _ = stop_rx.await;
        })
        .await
    });

    let mut a = connect(port).await;
    let mut b = connect(port).await;
    wait_for_connections(port, 2).await;

    let report: serde_json::Value = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/emit", port))
        .json(&json!({ "eventName": "test", "data": { "command": "test.start" } }))
        .send()
        .await
        .expect("POST /emit")
        .json()
        .await
        .expect("parse report");
    assert_eq!(
        report,
        json!({ "recipients": 2, "delivered": 2, "failed": 0 })
    );

    for ws in [&mut a, &mut b] {
        let v: serde_json::Value = serde_json::from_str(&next_text(ws).await).unwrap();
        assert_eq!(
            v,
            json!({ "eventName": "test", "data": { "command": "test.start" } })
        );
    }

    stop_tx.send(()).expect("server still running");
    assert!(closed_by_server(&mut a).await);
    assert!(closed_by_server(&mut b).await);

    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop within 5s")
        .expect("server task panicked");
    assert!(result.is_ok());
}

#[tokio::test]
async fn client_hangup_is_removed_from_the_registry() {
    let port = free_port();
    let mut config = Config::default();
    config.server.port = port;

    let server = tokio::spawn(async move {
        let _ = gateway::run_server(config).await;
    });

    let mut a = connect(port).await;
    let b = connect(port).await;
    wait_for_connections(port, 2).await;

    drop(b);
    wait_for_connections(port, 1).await;

    let report: serde_json::Value = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/emit", port))
        .json(&json!({ "eventName": "after.hangup", "data": [1, 2] }))
        .send()
        .await
        .expect("POST /emit")
        .json()
        .await
        .expect("parse report");
    assert_eq!(report["recipients"], json!(1));

    let v: serde_json::Value = serde_json::from_str(&next_text(&mut a).await).unwrap();
    assert_eq!(v["eventName"], json!("after.hangup"));
    assert_eq!(v["data"], json!([1, 2]));

    server.abort();
}

#[tokio::test]
async fn emit_requires_bearer_token_when_configured() {
    let port = free_port();
    let mut config = Config::default();
    config.server.port = port;
    config.server.emit_token = Some("s3cret".to_string());
    if std::env::var("FANOUT_EMIT_TOKEN").is_ok() {
        return;
    }

    let server = tokio::spawn(async move {
        let _ = gateway::run_server(config).await;
    });
    wait_for_connections(port, 0).await;

    let url = format!("http://127.0.0.1:{}/emit", port);
    let body = json!({ "eventName": "x", "data": {} });
    let client = reqwest::Client::new();

    let denied = client.post(&url).json(&body).send().await.expect("POST");
    assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

    let allowed = client
        .post(&url)
        .bearer_auth("s3cret")
        .json(&body)
        .send()
        .await
        .expect("POST");
    assert!(allowed.status().is_success());

    server.abort();
}

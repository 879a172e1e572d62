//! End-to-end tests of the export server over real sockets

use futures_util::{SinkExt, StreamExt};
use nirstream_core::dsp::calculation::HaemoValues;
use nirstream_core::storage::{RecordingRow, RecordingStore};
use nirstream_core::MemoryStore;
use nirstream_server::stream::PlaybackState;
use nirstream_server::{Encoding, ExportConfig, ExportServer, OutputShape, DEFAULT_SECRET};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn config(ports: Vec<u16>) -> ExportConfig {
    ExportConfig {
        bind_addr: "127.0.0.1".to_string(),
        ports,
        ..ExportConfig::default()
    }
}

fn store_with_rows(recording_id: u64, n: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_batch(&rows(recording_id, 0..n)).unwrap();
    store
}

fn rows(recording_id: u64, range: std::ops::Range<usize>) -> Vec<RecordingRow> {
    range
        .map(|i| RecordingRow {
            recording_id,
            time_stamp: i as f64 * 10.0,
            values: HaemoValues {
                o2hb: 1.0,
                hhb: 2.0,
                thb: 3.0,
                toi: 65.0,
            },
            raw: vec![0; 7],
            event: false,
        })
        .collect()
}

async fn connect(port: u16, secret: Option<&str>) -> Client {
    let mut request = format!("ws://127.0.0.1:{}/", port)
        .into_client_request()
        .unwrap();
    if let Some(secret) = secret {
        request
            .headers_mut()
            .insert("security-phrase", HeaderValue::from_str(secret).unwrap());
    }
    let (client, _) = connect_async(request).await.unwrap();
    client
}

/// Next text message, skipping pings
async fn next_text(client: &mut Client) -> Option<String> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .ok()??
            .ok()?;
        match msg {
            Message::Text(text) => return Some(text.as_str().to_string()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_missing_secret_is_rejected() {
    let server = ExportServer::start(config(vec![free_port()]), Arc::new(MemoryStore::new()), None)
        .await
        .unwrap();

    let mut client = connect(server.port(), None).await;
    let text = next_text(&mut client).await.unwrap();
    assert_eq!(text, "error:Security phrase was incorrect! Please try again.");
    assert!(next_text(&mut client).await.is_none());
    assert_eq!(server.state().client_count(), 0);

    let mut wrong = connect(server.port(), Some("guess")).await;
    assert!(next_text(&mut wrong).await.unwrap().starts_with("error:"));

    server.stop().await;
}

#[tokio::test]
async fn test_fourth_client_rejected_and_slot_freed() {
    let server = ExportServer::start(config(vec![free_port()]), Arc::new(MemoryStore::new()), None)
        .await
        .unwrap();
    let port = server.port();

    let mut a = connect(port, Some(DEFAULT_SECRET)).await;
    let b = connect(port, Some(DEFAULT_SECRET)).await;
    let _c = connect(port, Some(DEFAULT_SECRET)).await;
    assert_eq!(server.state().client_count(), 3);

    let mut d = connect(port, Some(DEFAULT_SECRET)).await;
    let text = next_text(&mut d).await.unwrap();
    assert!(text.starts_with("error:"));
    assert!(text.contains("maximum"));
    assert_eq!(server.state().client_count(), 3);

    // Existing clients are untouched
    a.send(Message::Text("get-protocol-version".into())).await.unwrap();
    assert_eq!(next_text(&mut a).await.unwrap(), "protocol-version:1");

    drop(b);
    let state = server.state().clone();
    wait_until(|| state.client_count() == 2).await;

    let mut e = connect(port, Some(DEFAULT_SECRET)).await;
    e.send(Message::Text("get-protocol-version".into())).await.unwrap();
    assert_eq!(next_text(&mut e).await.unwrap(), "protocol-version:1");
    assert_eq!(server.state().client_count(), 3);

    let names: Vec<String> = server.state().clients().into_iter().map(|c| c.name).collect();
    assert!(names.contains(&"client:4".to_string()));

    server.stop().await;
}

#[tokio::test]
async fn test_falls_back_to_next_free_port() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let busy = taken.local_addr().unwrap().port();
    let free = free_port();

    let server = ExportServer::start(config(vec![busy, free]), Arc::new(MemoryStore::new()), None)
        .await
        .unwrap();
    assert_eq!(server.port(), free);
    server.stop().await;
}

#[tokio::test]
async fn test_no_free_port_is_fatal() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let busy = taken.local_addr().unwrap().port();
    let result = ExportServer::start(config(vec![busy]), Arc::new(MemoryStore::new()), None).await;
    assert!(matches!(
        result,
        Err(nirstream_server::ServerError::NoAvailablePort)
    ));
}

#[tokio::test]
async fn test_stream_frames_in_order() {
    let store = store_with_rows(4, 100);
    let server = ExportServer::start(config(vec![free_port()]), store, None)
        .await
        .unwrap();
    server.state().select_recording(4);

    let mut client = connect(server.port(), Some(DEFAULT_SECRET)).await;
    client.send(Message::Text("start".into())).await.unwrap();
    assert_eq!(next_text(&mut client).await.unwrap(), "start");

    let first: serde_json::Value =
        serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    let points = first.as_array().unwrap();
    assert_eq!(points.len(), 25);
    assert_eq!(points[0]["timeStamp"], 0.0);
    assert_eq!(points[0]["TOI"], 65.0);
    assert_eq!(points[0]["HbDiff"], 0);

    let second: serde_json::Value =
        serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    assert_eq!(second[0]["timeStamp"], 250.0);

    client.send(Message::Text("stop".into())).await.unwrap();
    // A frame already in flight may arrive before the command echo
    let mut saw_stop = false;
    for _ in 0..3 {
        if next_text(&mut client).await.as_deref() == Some("stop") {
            saw_stop = true;
            break;
        }
    }
    assert!(saw_stop);
    assert_eq!(server.state().playback(), PlaybackState::Stopped);

    server.stop().await;
}

#[tokio::test]
async fn test_live_recording_keeps_streaming_after_catching_up() {
    let store = store_with_rows(6, 25);
    let server = ExportServer::start(config(vec![free_port()]), store.clone(), None)
        .await
        .unwrap();
    server.state().follow_recording(6);

    let mut client = connect(server.port(), Some(DEFAULT_SECRET)).await;
    client.send(Message::Text("start".into())).await.unwrap();
    assert_eq!(next_text(&mut client).await.unwrap(), "start");
    let first: serde_json::Value =
        serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    assert_eq!(first[0]["timeStamp"], 0.0);

    // Caught up: nothing to send, but playback carries on
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(server.state().playback(), PlaybackState::Streaming);

    store.insert_batch(&rows(6, 25..50)).unwrap();
    let second: serde_json::Value =
        serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    assert_eq!(second[0]["timeStamp"], 250.0);

    server.state().finish_recording();
    assert_eq!(next_text(&mut client).await.unwrap(), "stop");
    assert_eq!(server.state().playback(), PlaybackState::Stopped);

    server.stop().await;
}

#[tokio::test]
async fn test_single_point_delimited_frames() {
    let store = store_with_rows(2, 10);
    let cfg = ExportConfig {
        output_shape: OutputShape::SinglePoint,
        encoding: Encoding::Delimited,
        ..config(vec![free_port()])
    };
    let server = ExportServer::start(cfg, store, None).await.unwrap();
    server.state().select_recording(2);

    let mut client = connect(server.port(), Some(DEFAULT_SECRET)).await;
    // A reply proves the client is subscribed to broadcasts
    client.send(Message::Text("get-protocol-version".into())).await.unwrap();
    assert_eq!(next_text(&mut client).await.unwrap(), "protocol-version:1");

    server.state().start_stream().unwrap();
    assert_eq!(next_text(&mut client).await.unwrap(), "start");
    assert_eq!(
        next_text(&mut client).await.unwrap(),
        r#"["[0,1,2,3,65,0,0,0,0]"]"#
    );
    server.stop().await;
}

#[tokio::test]
async fn test_start_without_clients_fails() {
    let server = ExportServer::start(config(vec![free_port()]), store_with_rows(1, 10), None)
        .await
        .unwrap();
    server.state().select_recording(1);
    assert!(matches!(
        server.state().start_stream(),
        Err(nirstream_server::ServerError::NoClients)
    ));
    server.stop().await;
}

#[tokio::test]
async fn test_last_client_leaving_halts_playback() {
    let server = ExportServer::start(config(vec![free_port()]), store_with_rows(1, 1000), None)
        .await
        .unwrap();
    server.state().select_recording(1);

    let client = connect(server.port(), Some(DEFAULT_SECRET)).await;
    server.state().start_stream().unwrap();
    assert_eq!(server.state().playback(), PlaybackState::Streaming);

    drop(client);
    let state = server.state().clone();
    wait_until(|| state.client_count() == 0).await;
    assert_eq!(server.state().playback(), PlaybackState::Stopped);
    server.stop().await;
}

#[tokio::test]
async fn test_rest_status_requires_secret() {
    let server = ExportServer::start(config(vec![free_port()]), Arc::new(MemoryStore::new()), None)
        .await
        .unwrap();
    let url = format!("http://127.0.0.1:{}/api/v1/status", server.port());
    let http = reqwest::Client::new();

    let denied = http.get(&url).send().await.unwrap();
    assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

    let status: serde_json::Value = http
        .get(&url)
        .header("security-phrase", DEFAULT_SECRET)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["clients"], 0);
    assert_eq!(status["status"], "Active");
    assert_eq!(status["streaming"], "stopped");

    server.stop().await;
}

#[tokio::test]
async fn test_status_reports_error_after_listener_stops() {
    let server = ExportServer::start(config(vec![free_port()]), Arc::new(MemoryStore::new()), None)
        .await
        .unwrap();
    let state = server.state().clone();
    assert_eq!(state.status().status, "Active");
    assert!(state.is_listening());

    server.stop().await;
    assert!(!state.is_listening());
    assert_eq!(state.status().status, "Error");
}

#[tokio::test]
async fn test_rest_stream_control() {
    let server = ExportServer::start(config(vec![free_port()]), store_with_rows(3, 500), None)
        .await
        .unwrap();
    let _client = connect(server.port(), Some(DEFAULT_SECRET)).await;
    let url = format!("http://127.0.0.1:{}/api/v1/stream", server.port());

    let status: serde_json::Value = reqwest::Client::new()
        .post(&url)
        .header("security-phrase", DEFAULT_SECRET)
        .json(&serde_json::json!({ "action": "start", "recordingId": 3 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["streaming"], "streaming");
    assert_eq!(status["clients"], 1);
    server.stop().await;
}

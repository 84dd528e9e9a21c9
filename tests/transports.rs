#![cfg(all(feature = "http", unix))]

use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use embeddenator_gateway_mcp::http::router;
use embeddenator_gateway_mcp::{BackendConfig, Gateway, GatewayConfig};

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fake_mcp_server.sh");
const WAIT: Duration = Duration::from_secs(5);

async fn serve_gateway() -> (Gateway, SocketAddr) {
    let gateway = Gateway::new(GatewayConfig {
        message_timeout: WAIT,
        tool_timeout: WAIT,
        discovery_timeout: WAIT,
        start_grace: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(100),
        ..GatewayConfig::default()
    });
    gateway
        .add_backend("time", BackendConfig::new("sh").with_args([FIXTURE]))
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(gateway.clone(), None);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (gateway, addr)
}

async fn wait_for_sessions(gateway: &Gateway, count: usize) {
    for _ in 0..250 {
        if gateway.sessions().len().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} sessions, have {}", gateway.sessions().len().await);
}

/// Next JSON text frame, or `None` once the server closes the socket.
async fn next_frame<S>(socket: &mut S) -> Option<Value>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(WAIT, socket.next()).await.expect("timed out waiting for frame") {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("socket error: {e}"),
        }
    }
}

#[derive(Debug, Default)]
struct SseEvent {
    event: Option<String>,
    data: String,
    comment: Option<String>,
}

/// Splits a `text/event-stream` body into events.
struct EventReader {
    body: BoxStream<'static, Vec<u8>>,
    buf: String,
}

impl EventReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            body: response
                .bytes_stream()
                .map(|chunk| chunk.expect("event stream chunk").to_vec())
                .boxed(),
            buf: String::new(),
        }
    }

    async fn next(&mut self) -> SseEvent {
        loop {
            if let Some(end) = self.buf.find("\n\n") {
                let block: String = self.buf.drain(..end + 2).collect();
                return parse_event(&block);
            }
            let chunk = timeout(WAIT, self.body.next())
                .await
                .expect("timed out waiting for event")
                .expect("event stream ended");
            self.buf.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
}

fn parse_event(block: &str) -> SseEvent {
    let mut event = SseEvent::default();
    for line in block.lines() {
        if let Some(comment) = line.strip_prefix(':') {
            event.comment = Some(comment.trim().to_string());
        } else if let Some(name) = line.strip_prefix("event:") {
            event.event = Some(name.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            if !event.data.is_empty() {
                event.data.push('\n');
            }
            event.data.push_str(data.trim_start());
        }
    }
    event
}

#[tokio::test]
async fn test_socket_delivers_output_in_order_and_closes_session() {
    let (gateway, addr) = serve_gateway().await;
    let (mut socket, _) = connect_async(format!("ws://{addr}/backends/time/socket"))
        .await
        .unwrap();

    socket
        .send(Message::Text(
            json!({"jsonrpc": "2.0", "id": 7, "method": "chatter"}).to_string(),
        ))
        .await
        .unwrap();

    let mut seqs = Vec::new();
    loop {
        let frame = next_frame(&mut socket).await.expect("socket closed early");
        if frame["id"] == 7 {
            assert_eq!(frame["result"], json!({}));
            break;
        }
        if let Some(seq) = frame["params"]["seq"].as_i64() {
            seqs.push(seq);
        }
    }
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(gateway.sessions().len().await, 1);

    socket.close(None).await.unwrap();
    wait_for_sessions(&gateway, 0).await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_socket_skips_malformed_frames() {
    let (gateway, addr) = serve_gateway().await;
    let (mut socket, _) = connect_async(format!("ws://{addr}/backends/time/socket"))
        .await
        .unwrap();
    wait_for_sessions(&gateway, 1).await;

    // A malformed frame is dropped without closing the socket.
    socket.send(Message::Text("not json".into())).await.unwrap();
    socket
        .send(Message::Text(
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string(),
        ))
        .await
        .unwrap();
    let reply = next_frame(&mut socket).await.expect("socket closed early");
    assert_eq!(reply["id"], 1);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_socket_ends_when_backend_is_removed() {
    let (gateway, addr) = serve_gateway().await;
    let (mut socket, _) = connect_async(format!("ws://{addr}/backends/time/socket"))
        .await
        .unwrap();
    wait_for_sessions(&gateway, 1).await;

    gateway.remove_backend("time").await.unwrap();
    while next_frame(&mut socket).await.is_some() {}
    wait_for_sessions(&gateway, 0).await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_socket_for_unknown_backend_is_rejected() {
    let (gateway, addr) = serve_gateway().await;
    match connect_async(format!("ws://{addr}/backends/nope/socket")).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 404),
        Err(e) => panic!("expected 404, got {e}"),
        Ok(_) => panic!("upgrade to an unknown backend was accepted"),
    }
    assert!(gateway.sessions().is_empty().await);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_stream_session_lifecycle() {
    let (gateway, addr) = serve_gateway().await;
    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/backends/time/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let mut events = EventReader::new(response);

    let opened = events.next().await;
    assert_eq!(opened.event.as_deref(), Some("session"));
    let opened: Value = serde_json::from_str(&opened.data).unwrap();
    let session_id = opened["session_id"].as_str().unwrap().to_string();
    let post_url = opened["post_url"].as_str().unwrap().to_string();
    assert_eq!(opened["backend"], "time");
    assert_eq!(
        post_url,
        format!("http://{addr}/backends/time/stream?session_id={session_id}")
    );

    let info: Value = client
        .get(format!("http://{addr}/sessions/{session_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["transport"], "stream");
    assert_eq!(info["backend"], "time");

    let accepted = client
        .post(&post_url)
        .json(&json!({"jsonrpc": "2.0", "id": 3, "method": "chatter"}))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status().as_u16(), 202);

    let mut seqs = Vec::new();
    let mut heartbeats = 0;
    loop {
        let event = events.next().await;
        if event.comment.is_some() {
            heartbeats += 1;
            continue;
        }
        assert_eq!(event.event.as_deref(), Some("message"));
        let message: Value = serde_json::from_str(&event.data).unwrap();
        if message["id"] == 3 {
            break;
        }
        if let Some(seq) = message["params"]["seq"].as_i64() {
            seqs.push(seq);
        }
    }
    assert_eq!(seqs, vec![1, 2]);

    while heartbeats == 0 {
        if events.next().await.comment.as_deref() == Some("heartbeat") {
            heartbeats += 1;
        }
    }

    drop(events);
    wait_for_sessions(&gateway, 0).await;
    gateway.shutdown().await;
}

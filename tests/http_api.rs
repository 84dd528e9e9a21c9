#![cfg(all(feature = "http", unix))]

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use embeddenator_gateway_mcp::http::router;
use embeddenator_gateway_mcp::{Gateway, GatewayConfig};

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fake_mcp_server.sh");

fn gateway() -> Gateway {
    Gateway::new(GatewayConfig {
        message_timeout: Duration::from_secs(5),
        tool_timeout: Duration::from_secs(5),
        discovery_timeout: Duration::from_secs(5),
        start_grace: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(2),
        ..GatewayConfig::default()
    })
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    call_with(app, Request::builder().method(method).uri(uri), body).await
}

async fn call_with(
    app: &Router,
    builder: axum::http::request::Builder,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health_and_not_found() {
    let app = router(gateway(), None);

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["overall_status"], "healthy");

    let (status, body) = call(&app, "GET", "/backends/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "backend_not_found");

    let (status, body) = call(&app, "POST", "/call", Some(json!({"tool": "nope.tool"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "tool_not_found");
}

#[tokio::test]
async fn test_api_key_gate() {
    let app = router(gateway(), Some("secret".into()));

    let (status, _) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "GET", "/backends", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "unauthorized");

    let builder = Request::builder()
        .method("GET")
        .uri("/backends")
        .header("x-api-key", "secret");
    let (status, _) = call_with(&app, builder, None).await;
    assert_eq!(status, StatusCode::OK);

    let builder = Request::builder()
        .method("GET")
        .uri("/tools")
        .header("authorization", "Bearer secret");
    let (status, _) = call_with(&app, builder, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_backend_lifecycle_over_http() {
    let gateway = gateway();
    let app = router(gateway.clone(), None);

    let (status, body) = call(
        &app,
        "POST",
        "/backends",
        Some(json!({"name": "time", "config": {"command": "sh", "args": [FIXTURE]}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["alive"], true);
    assert_eq!(body["tools"], 2);

    let builder = Request::builder()
        .method("GET")
        .uri("/backends/time")
        .header("host", "gw.local:8000");
    let (status, body) = call_with(&app, builder, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["socket_url"], "ws://gw.local:8000/backends/time/socket");

    let (status, body) = call(&app, "GET", "/tools", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(2));

    let (status, body) = call(
        &app,
        "POST",
        "/call",
        Some(json!({"tool": "time.now", "arguments": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_error"], false);
    assert_eq!(body["result"]["content"][0]["text"], "called");

    let (status, body) = call(
        &app,
        "POST",
        "/backends/time/message",
        Some(json!({"jsonrpc": "2.0", "id": 42, "method": "ping"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 42);

    let (status, body) = call(
        &app,
        "POST",
        "/backends/time/message",
        Some(json!({"hello": "world"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_params");

    let (status, body) = call(&app, "POST", "/backends/time/restart", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["restartCount"], 1);
    assert_eq!(body["alive"], true);
    assert_eq!(body["tools"], 2);

    let (status, body) = call(&app, "POST", "/backends/nope/restart", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "backend_not_found");

    let (status, _) = call(&app, "DELETE", "/backends/time", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "GET", "/backends", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_stream_post_requires_known_session() {
    let gateway = gateway();
    let app = router(gateway.clone(), None);
    gateway
        .add_backend(
            "time",
            embeddenator_gateway_mcp::BackendConfig::new("sh").with_args([FIXTURE]),
        )
        .await
        .unwrap();

    let (status, body) = call(
        &app,
        "POST",
        "/backends/time/stream?session_id=missing",
        Some(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "session_not_found");

    let (status, body) = call(&app, "GET", "/sessions/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "session_not_found");

    gateway.shutdown().await;
}

//! HTTP, event-stream and WebSocket transports.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::distributor::SessionId;
use crate::error::Error;
use crate::gateway::{Gateway, RetrievedTool, SessionHandle};
use crate::protocol::{error_codes, JsonRpcMessage};
use crate::session::Transport;

#[derive(Clone)]
struct AppState {
    gateway: Gateway,
    api_key: Option<String>,
}

/// Build the router. When `api_key` is set, every route except `/` and
/// `/health` requires it.
pub fn router(gateway: Gateway, api_key: Option<String>) -> Router {
    let state = AppState {
        gateway,
        api_key: api_key.filter(|k| !k.trim().is_empty()),
    };

    let mut router = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/backends", get(list_backends_handler).post(add_backend_handler))
        .route(
            "/backends/:name",
            get(backend_detail_handler).delete(remove_backend_handler),
        )
        .route("/backends/:name/message", post(message_handler))
        .route("/backends/:name/initialize", post(initialize_handler))
        .route("/backends/:name/refresh", post(refresh_handler))
        .route("/backends/:name/restart", post(restart_handler))
        .route("/backends/:name/socket", get(socket_handler))
        .route(
            "/backends/:name/stream",
            get(stream_handler).post(stream_post_handler),
        )
        .route("/sessions/:id", get(session_handler))
        .route("/tools", get(list_tools_handler))
        .route("/call", post(call_handler))
        .route("/provision", post(provision_handler));

    if state.api_key.is_some() {
        router = router.layer(from_fn_with_state(state.clone(), require_api_key));
    }

    router
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(
    gateway: Gateway,
    addr: SocketAddr,
    api_key: Option<String>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP gateway listening");
    axum::serve(listener, router(gateway, api_key))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if path == "/" || path == "/health" {
        return next.run(request).await;
    }
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let headers = request.headers();
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let api_key = headers
        .get("x-api-key")
        .and_then(|h| h.to_str().ok())
        .map(str::trim);

    if bearer == Some(expected) || api_key == Some(expected) {
        return next.run(request).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"kind": "unauthorized", "message": "missing or invalid API key"}})),
    )
        .into_response()
}

// =============================================================================
// Errors
// =============================================================================

/// Gateway error rendered as `{error: {kind, message, suggestions?}}`.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::BackendNotFound(_) | Error::ToolNotFound { .. } | Error::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ResponseTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::ProcessStart { .. } | Error::Send { .. } | Error::Backend { .. } | Error::Protocol(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::InvalidParams(_) | Error::Config(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::Io(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "kind": self.0.kind(),
            "message": self.0.to_string(),
        });
        if let Error::ToolNotFound { suggestions, .. } = &self.0 {
            body["suggestions"] = json!(suggestions);
        }
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self.0, "request rejected");
        }
        (status, Json(json!({ "error": body }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_message(body: Value) -> ApiResult<JsonRpcMessage> {
    JsonRpcMessage::from_value(body)
        .map_err(|e| ApiError(Error::InvalidParams(format!("not a JSON-RPC message: {e}"))))
}

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

// =============================================================================
// Service and backends
// =============================================================================

async fn root_handler(State(state): State<AppState>) -> Json<Value> {
    let backends = state.gateway.list_backends().await;
    let tools = state.gateway.list_tools().await;
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "backends": backends.keys().collect::<Vec<_>>(),
        "tools": tools.len(),
        "delivery": state.gateway.config().delivery,
    }))
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let health = state.gateway.system_health().await;
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

async fn list_backends_handler(State(state): State<AppState>) -> Response {
    Json(state.gateway.list_backends().await).into_response()
}

#[derive(Debug, Deserialize)]
struct AddBackendBody {
    name: String,
    config: BackendConfig,
}

async fn add_backend_handler(
    State(state): State<AppState>,
    Json(body): Json<AddBackendBody>,
) -> ApiResult<Response> {
    let status = state.gateway.add_backend(&body.name, body.config).await?;
    Ok((StatusCode::CREATED, Json(status)).into_response())
}

async fn backend_detail_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let detail = state.gateway.backend_detail(&name, &base_url(&headers)).await?;
    Ok(Json(detail).into_response())
}

async fn remove_backend_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.gateway.remove_backend(&name).await?;
    Ok(Json(json!({"removed": name})))
}

async fn message_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let message = parse_message(body)?;
    match state.gateway.send_message(&name, &message).await? {
        Some(reply) => Ok(Json(reply.to_json()).into_response()),
        None => Ok((StatusCode::ACCEPTED, Json(json!({"status": "sent"}))).into_response()),
    }
}

async fn initialize_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<Value>>,
) -> ApiResult<Json<Value>> {
    let params = body.map(|Json(v)| v).filter(|v| !v.is_null());
    Ok(Json(state.gateway.initialize(&name, params).await?))
}

async fn refresh_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let tools = state.gateway.refresh_backend(&name).await?;
    Ok(Json(json!({"backend": name, "tools": tools})))
}

async fn restart_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let status = state.gateway.restart_backend(&name).await?;
    Ok(Json(status).into_response())
}

async fn session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let info = state.gateway.session_info(&id).await?;
    Ok(Json(info).into_response())
}

// =============================================================================
// Tools
// =============================================================================

async fn list_tools_handler(State(state): State<AppState>) -> Response {
    Json(state.gateway.list_tools().await).into_response()
}

#[derive(Debug, Deserialize)]
struct CallBody {
    tool: String,
    #[serde(default)]
    arguments: Option<Value>,
}

async fn call_handler(State(state): State<AppState>, Json(body): Json<CallBody>) -> ApiResult<Response> {
    let arguments = body.arguments.unwrap_or_else(|| json!({}));
    let outcome = state.gateway.call_tool(&body.tool, arguments).await?;
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
struct ProvisionBody {
    tools: Vec<RetrievedTool>,
}

async fn provision_handler(
    State(state): State<AppState>,
    Json(body): Json<ProvisionBody>,
) -> Response {
    Json(state.gateway.provision(&body.tools).await).into_response()
}

// =============================================================================
// WebSocket
// =============================================================================

async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    // Errors here still get an HTTP status; the session itself only exists
    // once the upgrade succeeds.
    state.gateway.ensure_known_backend(&name).await?;
    Ok(ws.on_upgrade(move |mut socket| async move {
        match state.gateway.open_session(&name, Transport::Socket).await {
            Ok(session) => run_socket(state.gateway, session, socket).await,
            Err(e) => {
                warn!(backend = %name, error = %e, "socket session unavailable");
                let frame = CloseFrame {
                    code: close_code::ERROR,
                    reason: e.kind().into(),
                };
                let _ = socket.send(Message::Close(Some(frame))).await;
            }
        }
    }))
}

async fn run_socket(gateway: Gateway, session: SessionHandle, socket: WebSocket) {
    let SessionHandle { id, backend, mut rx } = session;
    info!(session = %id, %backend, "socket connected");
    let (mut sink, mut frames) = socket.split();
    // Send failures for client requests, answered on the socket.
    let (errors_tx, mut errors_rx) = mpsc::channel::<JsonRpcMessage>(16);

    let outbound = async {
        loop {
            let message = tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => message,
                    // Session destroyed or backend removed.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                Some(message) = errors_rx.recv() => message,
            };
            if sink.send(Message::Text(message.to_json().to_string())).await.is_err() {
                break;
            }
        }
    };

    let inbound = async {
        while let Some(frame) = frames.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let message = match JsonRpcMessage::parse(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!(session = %id, error = %e, "dropping malformed frame");
                    continue;
                }
            };
            let request_id = match &message {
                JsonRpcMessage::Request { id, .. } => Some(id.clone()),
                _ => None,
            };
            match gateway.session_send(&id, message).await {
                Ok(()) => {}
                Err(Error::SessionNotFound(_)) => break,
                Err(e) => {
                    warn!(session = %id, error = %e, "forwarding failed");
                    if let Some(request_id) = request_id {
                        let reply = JsonRpcMessage::error(
                            Some(request_id),
                            error_codes::INTERNAL_ERROR,
                            format!("{}: {e}", e.kind()),
                        );
                        if errors_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
    }
    gateway.close_session(&id).await;
    info!(session = %id, %backend, "socket closed");
}

// =============================================================================
// Event stream
// =============================================================================

/// Closes the session when the event stream is dropped.
struct SessionGuard {
    gateway: Gateway,
    id: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let gateway = self.gateway.clone();
        let id = std::mem::take(&mut self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if gateway.close_session(&id).await {
                    debug!(session = %id, "stream client disconnected");
                }
            });
        }
    }
}

async fn stream_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let SessionHandle { id, backend, rx } = state.gateway.open_session(&name, Transport::Stream).await?;
    let opened = Event::default().event("session").data(
        json!({
            "session_id": id,
            "backend": backend,
            "post_url": format!("{}/backends/{backend}/stream?session_id={id}", base_url(&headers)),
        })
        .to_string(),
    );

    let guard = SessionGuard {
        gateway: state.gateway.clone(),
        id,
    };
    let messages = ReceiverStream::new(rx).map(move |message| {
        let _ = &guard;
        Ok(Event::default()
            .event("message")
            .data(message.to_json().to_string()))
    });
    let stream = futures::stream::iter([Ok(opened)]).chain(messages);

    let heartbeat = state.gateway.config().heartbeat_interval;
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat")))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    session_id: String,
}

async fn stream_post_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<StreamQuery>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let backend = state.gateway.sessions().backend_of(&query.session_id).await?;
    if backend != name {
        return Err(Error::SessionNotFound(query.session_id).into());
    }
    let message = parse_message(body)?;
    state.gateway.session_send(&query.session_id, message).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response())
}

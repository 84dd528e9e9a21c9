//! Fan-out of backend output to waiting callers and subscribed sessions.
//!
//! One distributor exists per backend name and outlives process restarts.
//! Each process generation gets its own reader task feeding
//! [`MessageDistributor::handle_line`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DeliveryMode;
use crate::error::{Error, Result};
use crate::protocol::{JsonRpcMessage, RequestId};

/// Session identifier.
pub type SessionId = String;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Waiter {
    token: u64,
    /// Process generation the request was written to.
    generation: Option<u64>,
    tx: oneshot::Sender<JsonRpcMessage>,
}

struct OwnedRoute {
    session: SessionId,
    original: RequestId,
}

/// Delivery counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryStats {
    /// Messages placed on session queues.
    pub delivered: u64,
    /// Messages dropped because a session queue was full.
    pub dropped: u64,
    /// Replies with no waiting caller.
    pub unmatched: u64,
    /// Output lines that were not JSON-RPC.
    pub parse_errors: u64,
}

/// Routes one backend's output.
pub struct MessageDistributor {
    backend: String,
    mode: DeliveryMode,
    generation: AtomicU64,
    next_token: AtomicU64,
    pending: Mutex<HashMap<RequestId, Waiter>>,
    subscribers: Mutex<HashMap<SessionId, mpsc::Sender<JsonRpcMessage>>>,
    routes: Mutex<HashMap<RequestId, OwnedRoute>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    unmatched: AtomicU64,
    parse_errors: AtomicU64,
}

impl MessageDistributor {
    /// Create a distributor for a backend.
    pub fn new(backend: impl Into<String>, mode: DeliveryMode) -> Arc<Self> {
        Arc::new(Self {
            backend: backend.into(),
            mode,
            generation: AtomicU64::new(0),
            next_token: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        })
    }

    /// Backend name.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Delivery mode.
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Start a new process generation and return its number.
    pub fn begin_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a caller waiting for the reply with `id`.
    pub fn register_pending(self: &Arc<Self>, id: RequestId) -> Result<PendingRequest> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut pending = lock(&self.pending);
        if pending.contains_key(&id) {
            return Err(Error::InvalidParams(format!(
                "request id {id} is already in flight on backend '{}'",
                self.backend
            )));
        }
        pending.insert(
            id.clone(),
            Waiter {
                token,
                generation: None,
                tx,
            },
        );
        Ok(PendingRequest {
            id,
            token,
            rx,
            distributor: Arc::clone(self),
        })
    }

    /// Bind a waiter to the process generation its request was written to.
    pub fn mark_sent(&self, id: &RequestId, generation: u64) {
        if let Some(waiter) = lock(&self.pending).get_mut(id) {
            waiter.generation = Some(generation);
        }
    }

    fn cancel_pending(&self, id: &RequestId, token: u64) {
        let mut pending = lock(&self.pending);
        if pending.get(id).is_some_and(|w| w.token == token) {
            pending.remove(id);
        }
    }

    /// In-flight requests.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Fail every waiter whose request went to `generation`. Called when
    /// that generation's output closes; requests not yet written survive.
    pub fn fail_pending(&self, generation: u64) {
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|_, waiter| waiter.generation != Some(generation));
        let failed = before - pending.len();
        if failed > 0 {
            warn!(backend = %self.backend, failed, "backend exited with requests in flight");
        }
    }

    /// Attach a session queue. A reused session id gets a fresh queue.
    pub fn subscribe(&self, session: &str, capacity: usize) -> mpsc::Receiver<JsonRpcMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        lock(&self.subscribers).insert(session.to_string(), tx);
        rx
    }

    /// Detach a session queue and forget its outstanding requests.
    pub fn unsubscribe(&self, session: &str) -> bool {
        lock(&self.routes).retain(|_, route| route.session != session);
        lock(&self.subscribers).remove(session).is_some()
    }

    /// Drop every session queue. Their receivers observe end of stream.
    pub fn close_all(&self) {
        lock(&self.routes).clear();
        lock(&self.subscribers).clear();
    }

    /// Attached sessions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Delivery counters.
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }

    /// Rewrite a session's outbound request for owned routing.
    ///
    /// In owned mode the wire id becomes `"<session>:<original>"` and the reply
    /// is routed back to that session only, with the original id restored.
    pub fn prepare_outbound(&self, session: &str, message: JsonRpcMessage) -> JsonRpcMessage {
        if self.mode != DeliveryMode::Owned {
            return message;
        }
        let JsonRpcMessage::Request { id, .. } = &message else {
            return message;
        };
        let wire_id = RequestId::String(format!("{session}:{id}"));
        lock(&self.routes).insert(
            wire_id.clone(),
            OwnedRoute {
                session: session.to_string(),
                original: id.clone(),
            },
        );
        message.with_id(wire_id)
    }

    /// Parse and route one output line. Non-protocol lines are dropped.
    pub fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match JsonRpcMessage::parse(line) {
            Ok(message) => self.dispatch(message),
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!(backend = %self.backend, error = %e, "dropping non-protocol output line");
                debug!(backend = %self.backend, line, "dropped line");
            }
        }
    }

    /// Route one decoded message.
    pub fn dispatch(&self, message: JsonRpcMessage) {
        if message.is_response() {
            if let Some(id) = message.id() {
                let waiter = lock(&self.pending).remove(id);
                match waiter {
                    Some(waiter) => {
                        // The caller may have given up already.
                        let _ = waiter.tx.send(message.clone());
                        if self.mode == DeliveryMode::Owned {
                            return;
                        }
                    }
                    None if self.mode == DeliveryMode::Owned => {
                        let route = lock(&self.routes).remove(id);
                        match route {
                            Some(route) => {
                                let restored = message.with_id(route.original);
                                self.deliver_to(&route.session, restored);
                            }
                            None => {
                                self.unmatched.fetch_add(1, Ordering::Relaxed);
                                debug!(backend = %self.backend, %id, "discarding unmatched reply");
                            }
                        }
                        return;
                    }
                    None => {
                        self.unmatched.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        self.broadcast(message);
    }

    fn broadcast(&self, message: JsonRpcMessage) {
        let mut subscribers = lock(&self.subscribers);
        let mut closed = Vec::new();
        for (session, tx) in subscribers.iter() {
            if !self.offer(session, tx, message.clone()) {
                closed.push(session.clone());
            }
        }
        for session in closed {
            debug!(backend = %self.backend, %session, "removing closed session queue");
            subscribers.remove(&session);
        }
    }

    fn deliver_to(&self, session: &str, message: JsonRpcMessage) {
        let mut subscribers = lock(&self.subscribers);
        let open = match subscribers.get(session) {
            Some(tx) => self.offer(session, tx, message),
            // Destroyed sessions silently lose late deliveries.
            None => true,
        };
        if !open {
            subscribers.remove(session);
        }
    }

    /// Non-blocking enqueue. Returns false when the queue is closed.
    fn offer(&self, session: &str, tx: &mpsc::Sender<JsonRpcMessage>, message: JsonRpcMessage) -> bool {
        match tx.try_send(message) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(backend = %self.backend, %session, "session queue full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// A caller waiting for one reply. Dropping it withdraws the registration.
pub struct PendingRequest {
    id: RequestId,
    token: u64,
    rx: oneshot::Receiver<JsonRpcMessage>,
    distributor: Arc<MessageDistributor>,
}

impl PendingRequest {
    /// The awaited id.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the reply. On timeout the registration is removed and the
    /// backend is left alone.
    pub async fn wait(self, timeout: Duration) -> Result<JsonRpcMessage> {
        self.wait_until(Instant::now() + timeout, timeout).await
    }

    /// Wait until `deadline`, reporting `budget` as the timeout on expiry.
    pub async fn wait_until(mut self, deadline: Instant, budget: Duration) -> Result<JsonRpcMessage> {
        let backend = self.distributor.backend.clone();
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(Error::Send {
                name: backend,
                reason: "backend exited before replying".into(),
            }),
            Err(_) => Err(Error::ResponseTimeout {
                name: backend,
                timeout_ms: budget.as_millis() as u64,
            }),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.distributor.cancel_pending(&self.id, self.token);
    }
}

/// Feed one process generation's stdout into the distributor until EOF.
pub async fn read_stdout<R>(distributor: Arc<MessageDistributor>, stdout: R, generation: u64)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => distributor.handle_line(&String::from_utf8_lossy(&buf)),
            Err(e) => {
                warn!(backend = %distributor.backend, error = %e, "stdout read failed");
                break;
            }
        }
    }
    info!(backend = %distributor.backend, generation, "backend output closed");
    distributor.fail_pending(generation);
}

/// Re-emit a backend's stderr as log events.
pub async fn log_stderr<R>(backend: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    info!(backend = %backend, stderr = %line, "backend stderr");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(id: i64) -> String {
        json!({"jsonrpc": "2.0", "id": id, "result": {"id": id}}).to_string()
    }

    #[tokio::test]
    async fn test_pending_matched_among_interleaved_traffic() {
        let dist = MessageDistributor::new("time", DeliveryMode::Broadcast);
        let pending = dist.register_pending(RequestId::Number(42)).unwrap();

        dist.handle_line(r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#);
        dist.handle_line(&reply(7));
        dist.handle_line(r#"{"jsonrpc":"2.0","id":42,"method":"sampling/createMessage"}"#);
        dist.handle_line(&reply(42));

        let msg = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg, JsonRpcMessage::response(42.into(), json!({"id": 42})));
        assert_eq!(dist.pending_count(), 0);
        assert_eq!(dist.stats().unmatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending() {
        let dist = MessageDistributor::new("slow", DeliveryMode::Broadcast);
        let pending = dist.register_pending(RequestId::Number(42)).unwrap();
        assert_eq!(dist.pending_count(), 1);

        let err = pending.wait(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, Error::ResponseTimeout { timeout_ms: 10_000, .. }));
        assert_eq!(dist.pending_count(), 0);

        // A late reply is discarded as unmatched.
        dist.handle_line(&reply(42));
        assert_eq!(dist.stats().unmatched, 1);
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_rejected() {
        let dist = MessageDistributor::new("time", DeliveryMode::Broadcast);
        let _first = dist.register_pending(RequestId::Number(1)).unwrap();
        assert!(dist.register_pending(RequestId::Number(1)).is_err());
        assert!(dist.register_pending(RequestId::from("1")).is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order_per_session() {
        let dist = MessageDistributor::new("search", DeliveryMode::Broadcast);
        let mut a = dist.subscribe("a", 16);
        let mut b = dist.subscribe("b", 16);

        for seq in 0..5 {
            dist.handle_line(
                &json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"seq": seq}})
                    .to_string(),
            );
        }

        for rx in [&mut a, &mut b] {
            for seq in 0..5 {
                let msg = rx.recv().await.unwrap();
                assert_eq!(msg.params(), Some(&json!({"seq": seq})));
            }
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_without_blocking() {
        let dist = MessageDistributor::new("search", DeliveryMode::Broadcast);
        let mut rx = dist.subscribe("slow", 1);

        dist.handle_line(&reply(1));
        dist.handle_line(&reply(2));

        assert_eq!(rx.recv().await.unwrap().id(), Some(&RequestId::Number(1)));
        assert!(rx.try_recv().is_err());
        assert_eq!(dist.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_closed_sessions_are_pruned() {
        let dist = MessageDistributor::new("search", DeliveryMode::Broadcast);
        let rx = dist.subscribe("gone", 4);
        let _keep = dist.subscribe("kept", 4);
        drop(rx);

        dist.handle_line(&reply(1));
        assert_eq!(dist.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_owned_routing_returns_reply_to_issuer() {
        let dist = MessageDistributor::new("search", DeliveryMode::Owned);
        let mut a = dist.subscribe("a", 4);
        let mut b = dist.subscribe("b", 4);

        let out_a = dist.prepare_outbound("a", JsonRpcMessage::request(1, "ping", None));
        let out_b = dist.prepare_outbound("b", JsonRpcMessage::request(1, "ping", None));
        assert_ne!(out_a.id(), out_b.id());

        let wire_b = out_b.id().cloned().unwrap();
        dist.dispatch(JsonRpcMessage::response(wire_b, json!({"from": "b"})));

        let got = b.recv().await.unwrap();
        assert_eq!(got, JsonRpcMessage::response(1.into(), json!({"from": "b"})));
        assert!(a.try_recv().is_err());

        // Notifications still reach everyone.
        dist.dispatch(JsonRpcMessage::notification("notifications/message", None));
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_owned_mode_keeps_gateway_replies_private() {
        let dist = MessageDistributor::new("search", DeliveryMode::Owned);
        let mut session = dist.subscribe("a", 4);
        let pending = dist.register_pending(RequestId::from("gateway-1")).unwrap();

        dist.dispatch(JsonRpcMessage::response("gateway-1".into(), json!({})));
        assert!(pending.wait(Duration::from_secs(1)).await.is_ok());
        assert!(session.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reader_drops_garbage_and_fails_pending_at_eof() {
        let dist = MessageDistributor::new("time", DeliveryMode::Broadcast);
        let generation = dist.begin_generation();
        let mut rx = dist.subscribe("s", 8);
        let orphaned = dist.register_pending(RequestId::Number(99)).unwrap();
        dist.mark_sent(&RequestId::Number(99), generation);

        let output = format!("booting...\n{}\n\n{{broken\n", reply(1));
        read_stdout(Arc::clone(&dist), output.as_bytes(), generation).await;

        assert_eq!(rx.recv().await.unwrap().id(), Some(&RequestId::Number(1)));
        assert_eq!(dist.stats().parse_errors, 2);

        let err = orphaned.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Send { .. }));
    }

    #[tokio::test]
    async fn test_old_generation_eof_spares_new_requests() {
        let dist = MessageDistributor::new("time", DeliveryMode::Broadcast);
        let old = dist.begin_generation();
        let new = dist.begin_generation();
        let _written = dist.register_pending(RequestId::Number(5)).unwrap();
        dist.mark_sent(&RequestId::Number(5), new);
        let _unwritten = dist.register_pending(RequestId::Number(6)).unwrap();

        dist.fail_pending(old);
        assert_eq!(dist.pending_count(), 2);
        dist.fail_pending(new);
        assert_eq!(dist.pending_count(), 1);
    }
}

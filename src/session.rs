//! Per-connection session state.
//!
//! Sessions refer to their backend by name and to their queue through the
//! backend's distributor; nothing here holds a process or distributor.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::distributor::{MessageDistributor, SessionId};
use crate::error::{Error, Result};
use crate::protocol::JsonRpcMessage;

/// Public transport a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Bidirectional socket.
    Socket,
    /// Long-lived event stream plus POSTs.
    Stream,
    /// In-process caller.
    Direct,
}

/// One client's dialogue with one backend.
#[derive(Debug, Clone)]
struct Session {
    backend: String,
    transport: Transport,
    initialized: bool,
    protocol_version: Option<String>,
    client_capabilities: Option<Value>,
    client_info: Option<Value>,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    messages_sent: u64,
}

/// Session snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub backend: String,
    pub transport: Transport,
    pub initialized: bool,
    pub protocol_version: Option<String>,
    pub client_capabilities: Option<Value>,
    pub client_info: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub messages_sent: u64,
}

/// Owns every live session.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Session>>,
    queue_capacity: usize,
}

impl SessionManager {
    /// Create a manager with the given per-session queue bound.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Allocate a session and attach a fresh queue to the backend's distributor.
    pub async fn create(
        &self,
        backend: &str,
        transport: Transport,
        distributor: &MessageDistributor,
    ) -> (SessionId, mpsc::Receiver<JsonRpcMessage>) {
        let id = Uuid::new_v4().to_string();
        let rx = distributor.subscribe(&id, self.queue_capacity);
        self.sessions.write().await.insert(
            id.clone(),
            Session {
                backend: backend.to_string(),
                transport,
                initialized: false,
                protocol_version: None,
                client_capabilities: None,
                client_info: None,
                created_at: Utc::now(),
                last_activity: Instant::now(),
                messages_sent: 0,
            },
        );
        info!(session = %id, backend, ?transport, "session created");
        (id, rx)
    }

    /// Track a client-to-backend message and return the session's backend.
    ///
    /// The first `initialize` request fixes the negotiated version and
    /// capabilities; the `initialized` notification completes the handshake.
    pub async fn observe_client_message(&self, id: &str, message: &JsonRpcMessage) -> Result<String> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.last_activity = Instant::now();
        session.messages_sent += 1;

        match message {
            JsonRpcMessage::Request { method, params, .. }
                if method == "initialize" && session.protocol_version.is_none() =>
            {
                let params = params.as_ref();
                session.protocol_version = params
                    .and_then(|p| p.get("protocolVersion"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                session.client_capabilities = params.and_then(|p| p.get("capabilities")).cloned();
                session.client_info = params.and_then(|p| p.get("clientInfo")).cloned();
                debug!(session = %id, version = ?session.protocol_version, "initialize observed");
            }
            JsonRpcMessage::Notification { method, .. }
                if method == "notifications/initialized" || method == "initialized" =>
            {
                session.initialized = true;
                debug!(session = %id, "session initialized");
            }
            _ => {}
        }
        Ok(session.backend.clone())
    }

    /// Destroy a session and release its queue. Returns false if unknown.
    pub async fn destroy(&self, id: &str, distributor: Option<&MessageDistributor>) -> bool {
        let removed = self.sessions.write().await.remove(id);
        if let Some(distributor) = distributor {
            distributor.unsubscribe(id);
        }
        match removed {
            Some(session) => {
                info!(session = %id, backend = %session.backend, "session destroyed");
                true
            }
            None => false,
        }
    }

    /// Backend a session talks to.
    pub async fn backend_of(&self, id: &str) -> Result<String> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|s| s.backend.clone())
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Snapshot of one session.
    pub async fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(id).map(|s| info_of(id, s))
    }

    /// Snapshot of all sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut all: Vec<_> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| info_of(id, s))
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Sessions attached to a backend.
    pub async fn ids_for(&self, backend: &str) -> Vec<SessionId> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.backend == backend)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Sessions with no client activity for longer than `timeout`, with their backend.
    pub async fn expired(&self, timeout: Duration) -> Vec<(SessionId, String)> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.last_activity.elapsed() > timeout)
            .map(|(id, s)| (id.clone(), s.backend.clone()))
            .collect()
    }

    /// Total live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

fn info_of(id: &str, session: &Session) -> SessionInfo {
    SessionInfo {
        id: id.to_string(),
        backend: session.backend.clone(),
        transport: session.transport,
        initialized: session.initialized,
        protocol_version: session.protocol_version.clone(),
        client_capabilities: session.client_capabilities.clone(),
        client_info: session.client_info.clone(),
        created_at: session.created_at,
        messages_sent: session.messages_sent,
    }
}

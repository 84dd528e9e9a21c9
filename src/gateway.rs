//! The gateway facade.
//!
//! Ties the registry, catalog, sessions and monitor together behind the
//! operations the transports expose. Cloning is cheap; every clone drives
//! the same gateway.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{ToolCatalog, ToolEntry};
use crate::config::{BackendConfig, GatewayConfig, McpServersFile};
use crate::distributor::{lock, SessionId};
use crate::error::{Error, Result};
use crate::health::SystemHealth;
use crate::monitor::{ProcessMonitor, ProcessTable, SystemProcessTable};
use crate::protocol::{client_initialize_params, JsonRpcMessage};
use crate::registry::{BackendRegistry, BackendStatus};
use crate::session::{SessionInfo, SessionManager, Transport};

/// A backend's status plus the URLs of its transports.
#[derive(Debug, Clone, Serialize)]
pub struct BackendDetail {
    #[serde(flatten)]
    pub status: BackendStatus,
    pub socket_url: String,
    pub stream_url: String,
    pub tool_entries: Vec<ToolEntry>,
}

/// Result of a routed tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallOutcome {
    pub tool: String,
    pub backend: String,
    /// The backend's `tools/call` result, unmodified.
    pub result: Value,
    pub is_error: bool,
}

/// One ranked tool descriptor from the retrieval service.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievedTool {
    pub tool_name: String,
    #[serde(default, alias = "description")]
    pub tool_description: String,
    #[serde(default)]
    pub tool_parameters: Option<Value>,
    #[serde(default)]
    pub tool_required_parameters: Option<Value>,
    #[serde(default)]
    pub vendor_name: Option<String>,
    #[serde(default)]
    pub vendor_repo: Option<String>,
    #[serde(default, alias = "relevance_score")]
    pub similarity_score: Option<f64>,
    #[serde(default)]
    pub mcp_server_config: Option<McpServersFile>,
}

/// Outcome of provisioning retrieved tools.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    /// Backends now running.
    pub ensured: Vec<String>,
    /// Backends that failed, with the reason.
    pub failed: BTreeMap<String, String>,
    /// Tools that carried no launch configuration.
    pub skipped: Vec<String>,
}

/// A live session and its inbound queue.
pub struct SessionHandle {
    pub id: SessionId,
    pub backend: String,
    pub rx: mpsc::Receiver<JsonRpcMessage>,
}

/// Entry point for every transport.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    registry: Arc<BackendRegistry>,
    catalog: Arc<ToolCatalog>,
    sessions: Arc<SessionManager>,
    monitor: Arc<ProcessMonitor>,
    shutdown: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Gateway {
    /// Create a gateway that monitors the real OS process table.
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_process_table(config, Arc::new(SystemProcessTable::new()))
    }

    /// Create a gateway with a custom process table.
    pub fn with_process_table(config: GatewayConfig, table: Arc<dyn ProcessTable>) -> Self {
        let catalog = Arc::new(ToolCatalog::new());
        let registry = Arc::new(BackendRegistry::new(config.clone(), Arc::clone(&catalog)));
        let monitor = Arc::new(ProcessMonitor::new(Arc::clone(&registry), table));
        let sessions = Arc::new(SessionManager::new(config.session_queue_capacity));
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            registry,
            catalog,
            sessions,
            monitor,
            shutdown,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Start the popular backends and the background loops. Returns the
    /// popular backends that failed to come up.
    pub async fn start(&self, popular: BTreeMap<String, BackendConfig>) -> Vec<(String, Error)> {
        info!(popular = popular.len(), "starting gateway");
        let failed = self.registry.start_popular(popular).await;

        let reaper = self.spawn_idle_reaper();
        let monitor = Arc::clone(&self.monitor).spawn(self.shutdown.subscribe());
        let sessions = self.spawn_session_reaper();
        lock(&self.tasks).extend([reaper, monitor, sessions]);
        failed
    }

    fn spawn_idle_reaper(&self) -> JoinHandle<()> {
        let gateway = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gateway.config.cleanup_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = gateway.reap_idle_backends().await;
                        if !removed.is_empty() {
                            info!(?removed, "idle cleanup finished");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("idle reaper stopped");
        })
    }

    fn spawn_session_reaper(&self) -> JoinHandle<()> {
        let gateway = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gateway.config.monitor_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = gateway.reap_sessions().await;
                        if reaped > 0 {
                            info!(reaped, "inactive sessions closed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("session reaper stopped");
        })
    }

    /// Stop the background loops, then every backend.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        let _ = self.shutdown.send(());
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        futures::future::join_all(tasks).await;
        self.registry.shutdown().await;
    }

    // =========================================================================
    // Backends
    // =========================================================================

    /// Status of every registered backend.
    pub async fn list_backends(&self) -> BTreeMap<String, BackendStatus> {
        self.registry.status().await
    }

    /// Status, tools and transport URLs of one backend. `base_url` is the
    /// externally visible `http://host:port` prefix.
    pub async fn backend_detail(&self, name: &str, base_url: &str) -> Result<BackendDetail> {
        let status = self.registry.status_of(name).await?;
        let tool_entries = self
            .catalog
            .capabilities(name)
            .await
            .map(|caps| caps.tools)
            .unwrap_or_default();
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        Ok(BackendDetail {
            status,
            socket_url: format!("{ws_base}/backends/{name}/socket"),
            stream_url: format!("{base}/backends/{name}/stream"),
            tool_entries,
        })
    }

    /// Register and start a dynamic backend.
    pub async fn add_backend(&self, name: &str, config: BackendConfig) -> Result<BackendStatus> {
        self.registry.add(name, config).await?;
        self.registry.status_of(name).await
    }

    /// Remove a dynamic backend, closing its sessions.
    pub async fn remove_backend(&self, name: &str) -> Result<()> {
        self.registry.remove(name).await?;
        self.destroy_sessions_of(name).await;
        Ok(())
    }

    /// Remove dynamic backends idle past the configured TTL, closing any
    /// sessions left on them.
    pub async fn reap_idle_backends(&self) -> Vec<String> {
        let removed = self.registry.cleanup_idle(self.config.idle_ttl).await;
        for name in &removed {
            self.destroy_sessions_of(name).await;
        }
        removed
    }

    async fn destroy_sessions_of(&self, backend: &str) {
        for id in self.sessions.ids_for(backend).await {
            self.sessions.destroy(&id, None).await;
        }
    }

    /// Restart a backend and rediscover its tools.
    pub async fn restart_backend(&self, name: &str) -> Result<BackendStatus> {
        let tools = self.registry.restart(name).await?;
        info!(backend = %name, tools, "backend restart finished");
        self.registry.status_of(name).await
    }

    /// Make sure a backend is running, registering it as dynamic if unknown.
    pub async fn ensure_backend(&self, name: &str, config: BackendConfig) -> Result<()> {
        self.registry.ensure(name, config).await
    }

    /// Make sure a registered backend is running.
    pub async fn ensure_known_backend(&self, name: &str) -> Result<()> {
        self.registry.ensure_known(name).await
    }

    /// Re-run discovery for one backend.
    pub async fn refresh_backend(&self, name: &str) -> Result<usize> {
        self.registry.refresh(name).await
    }

    /// Ensure every backend embedded in retrieved tool descriptors.
    pub async fn provision(&self, tools: &[RetrievedTool]) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        let mut seen = BTreeSet::new();
        for tool in tools {
            let Some(servers) = &tool.mcp_server_config else {
                report.skipped.push(tool.tool_name.clone());
                continue;
            };
            for (name, config) in &servers.servers {
                if !seen.insert(name.clone()) {
                    continue;
                }
                let result = if self.registry.contains(name).await {
                    self.registry.ensure_known(name).await
                } else {
                    self.registry.ensure(name, config.clone()).await
                };
                match result {
                    Ok(()) => report.ensured.push(name.clone()),
                    Err(e) => {
                        warn!(backend = %name, tool = %tool.tool_name, error = %e, "provisioning failed");
                        report.failed.insert(name.clone(), e.to_string());
                    }
                }
            }
        }
        info!(
            ensured = report.ensured.len(),
            failed = report.failed.len(),
            "provisioning finished"
        );
        report
    }

    // =========================================================================
    // Messages and tools
    // =========================================================================

    /// Forward one message to a backend and wait for its reply. Returns
    /// `None` for notifications.
    pub async fn send_message(&self, name: &str, message: &JsonRpcMessage) -> Result<Option<JsonRpcMessage>> {
        self.registry.ensure_known(name).await?;
        self.registry
            .send_and_wait(name, message, self.config.message_timeout)
            .await
    }

    /// Run the MCP handshake against a backend on the caller's behalf.
    pub async fn initialize(&self, name: &str, params: Option<Value>) -> Result<Value> {
        self.registry.ensure_known(name).await?;
        let params = params.unwrap_or_else(client_initialize_params);
        let result = self
            .registry
            .request(name, "initialize", Some(params), self.config.message_timeout)
            .await?;
        self.registry
            .send(name, &JsonRpcMessage::notification("notifications/initialized", None))
            .await?;
        Ok(result)
    }

    /// Every discovered tool.
    pub async fn list_tools(&self) -> Vec<ToolEntry> {
        self.catalog.list_tools().await
    }

    /// Invoke a tool by qualified name.
    pub async fn call_tool(&self, qualified_name: &str, arguments: Value) -> Result<ToolCallOutcome> {
        let (backend, tool) = self.catalog.resolve(qualified_name).await?;
        self.registry.ensure_known(&backend).await?;
        debug!(%backend, %tool, "calling tool");
        let result = self
            .registry
            .request(
                &backend,
                "tools/call",
                Some(json!({"name": tool, "arguments": arguments})),
                self.config.tool_timeout,
            )
            .await?;
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(ToolCallOutcome {
            tool,
            backend,
            result,
            is_error,
        })
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Open a session on a running backend.
    pub async fn open_session(&self, backend: &str, transport: Transport) -> Result<SessionHandle> {
        self.registry.ensure_known(backend).await?;
        let distributor = self.registry.distributor(backend).await?;
        let (id, rx) = self.sessions.create(backend, transport, &distributor).await;
        Ok(SessionHandle {
            id,
            backend: backend.to_string(),
            rx,
        })
    }

    /// Forward a client message from a session. Replies arrive on the
    /// session's queue. A crashed backend is restarted and handshaken
    /// before the message is written.
    pub async fn session_send(&self, session: &str, message: JsonRpcMessage) -> Result<()> {
        let backend = self.sessions.observe_client_message(session, &message).await?;
        let distributor = self.registry.distributor(&backend).await?;
        let outbound = distributor.prepare_outbound(session, message);
        self.registry.send(&backend, &outbound).await
    }

    /// Close a session. Returns false if it was already gone.
    pub async fn close_session(&self, session: &str) -> bool {
        let distributor = match self.sessions.backend_of(session).await {
            Ok(backend) => self.registry.distributor(&backend).await.ok(),
            Err(_) => return false,
        };
        self.sessions.destroy(session, distributor.as_deref()).await
    }

    /// Snapshot of one session.
    pub async fn session_info(&self, session: &str) -> Result<SessionInfo> {
        self.sessions
            .get(session)
            .await
            .ok_or_else(|| Error::SessionNotFound(session.to_string()))
    }

    /// Close sessions idle for longer than the configured timeout.
    pub async fn reap_sessions(&self) -> usize {
        let mut reaped = 0;
        for (id, backend) in self.sessions.expired(self.config.session_idle_timeout).await {
            debug!(session = %id, %backend, "closing inactive session");
            if self.close_session(&id).await {
                reaped += 1;
            }
        }
        reaped
    }

    /// Aggregate health.
    pub async fn system_health(&self) -> SystemHealth {
        self.monitor.system_health().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::DeliveryMode;
    use crate::protocol::RequestId;
    use crate::testing::{fake_backend, fast_config};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(rx: &mut mpsc::Receiver<JsonRpcMessage>) -> JsonRpcMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("session queue closed")
    }

    fn seq(message: &JsonRpcMessage) -> Option<i64> {
        message.params()?.get("seq")?.as_i64()
    }

    #[tokio::test]
    async fn test_sessions_receive_broadcast_in_order() {
        let gateway = Gateway::new(fast_config());
        gateway.add_backend("search", fake_backend()).await.unwrap();
        let mut a = gateway.open_session("search", Transport::Stream).await.unwrap();
        let mut b = gateway.open_session("search", Transport::Socket).await.unwrap();

        gateway
            .session_send(&a.id, JsonRpcMessage::request(7, "chatter", None))
            .await
            .unwrap();

        for rx in [&mut a.rx, &mut b.rx] {
            assert_eq!(seq(&next(rx).await), Some(1));
            assert_eq!(seq(&next(rx).await), Some(2));
            let reply = next(rx).await;
            assert_eq!(reply.id(), Some(&RequestId::Number(7)));
        }
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_owned_mode_routes_replies_to_issuer() {
        let config = GatewayConfig {
            delivery: DeliveryMode::Owned,
            ..fast_config()
        };
        let gateway = Gateway::new(config);
        gateway.add_backend("search", fake_backend()).await.unwrap();
        let mut a = gateway.open_session("search", Transport::Socket).await.unwrap();
        let mut b = gateway.open_session("search", Transport::Socket).await.unwrap();

        gateway
            .session_send(&a.id, JsonRpcMessage::request(1, "ping", None))
            .await
            .unwrap();
        let reply = next(&mut a.rx).await;
        assert_eq!(reply.id(), Some(&RequestId::Number(1)));

        gateway
            .session_send(&b.id, JsonRpcMessage::request(1, "ping", None))
            .await
            .unwrap();
        let reply = next(&mut b.rx).await;
        assert_eq!(reply.id(), Some(&RequestId::Number(1)));

        assert!(a.rx.try_recv().is_err());
        assert!(b.rx.try_recv().is_err());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_tool_routes_through_catalog() {
        let gateway = Gateway::new(fast_config());
        gateway.add_backend("time", fake_backend()).await.unwrap();

        let names: Vec<_> = gateway
            .list_tools()
            .await
            .into_iter()
            .map(|t| t.qualified_name)
            .collect();
        assert_eq!(names, vec!["time.echo", "time.now"]);

        let outcome = gateway.call_tool("time.echo", json!({"x": 1})).await.unwrap();
        assert_eq!(outcome.backend, "time");
        assert_eq!(outcome.tool, "echo");
        assert!(!outcome.is_error);
        assert_eq!(outcome.result["content"][0]["text"], "called");

        match gateway.call_tool("time.ech", json!({})).await {
            Err(Error::ToolNotFound { suggestions, .. }) => {
                assert!(suggestions.contains(&"time.echo".to_string()));
            }
            other => panic!("expected ToolNotFound, got {other:?}"),
        }
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_message_waits_for_reply() {
        let gateway = Gateway::new(fast_config());
        gateway.add_backend("time", fake_backend()).await.unwrap();

        let reply = gateway
            .send_message("time", &JsonRpcMessage::request("abc", "ping", None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id(), Some(&RequestId::from("abc")));

        let none = gateway
            .send_message("time", &JsonRpcMessage::notification("notifications/cancelled", None))
            .await
            .unwrap();
        assert!(none.is_none());

        let init = gateway.initialize("time", None).await.unwrap();
        assert_eq!(init["serverInfo"]["name"], "fake");
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_backend_closes_sessions() {
        let gateway = Gateway::new(fast_config());
        gateway.add_backend("scratch", fake_backend()).await.unwrap();
        let mut session = gateway.open_session("scratch", Transport::Stream).await.unwrap();

        gateway.remove_backend("scratch").await.unwrap();
        assert!(session.rx.recv().await.is_none());
        assert!(gateway.sessions().is_empty().await);
        assert!(gateway.list_tools().await.is_empty());

        let health = gateway.system_health().await;
        assert_eq!(
            health.servers["scratch"].state,
            crate::health::ServerState::Stopped
        );
    }

    #[tokio::test]
    async fn test_provision_ensures_embedded_backends() {
        let gateway = Gateway::new(fast_config());
        let script = fake_backend().args[0].clone();
        let tools: Vec<RetrievedTool> = serde_json::from_value(json!([
            {
                "tool_name": "echo",
                "tool_description": "Echo",
                "similarity_score": 0.9,
                "mcp_server_config": {
                    "mcpServers": {"retrieved": {"command": "sh", "args": [script]}}
                }
            },
            {"tool_name": "orphan", "description": "no config"}
        ]))
        .unwrap();

        let report = gateway.provision(&tools).await;
        assert_eq!(report.ensured, vec!["retrieved"]);
        assert!(report.failed.is_empty());
        assert_eq!(report.skipped, vec!["orphan"]);
        assert!(gateway.list_backends().await["retrieved"].alive);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_detail_urls() {
        let gateway = Gateway::new(fast_config());
        gateway.add_backend("time", fake_backend()).await.unwrap();
        let detail = gateway
            .backend_detail("time", "http://localhost:8000/")
            .await
            .unwrap();
        assert_eq!(detail.socket_url, "ws://localhost:8000/backends/time/socket");
        assert_eq!(detail.stream_url, "http://localhost:8000/backends/time/stream");
        assert_eq!(detail.tool_entries.len(), 2);
        gateway.shutdown().await;
    }

    async fn reply_to(rx: &mut mpsc::Receiver<JsonRpcMessage>, id: i64) -> JsonRpcMessage {
        loop {
            let message = next(rx).await;
            if message.id() == Some(&RequestId::Number(id)) {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_session_traffic_after_crash_is_initialized() {
        let gateway = Gateway::new(fast_config());
        let strict = fake_backend().with_env("FAKE_MCP_STRICT", "1");
        gateway.add_backend("strict", strict).await.unwrap();
        let mut session = gateway.open_session("strict", Transport::Socket).await.unwrap();

        gateway
            .session_send(&session.id, JsonRpcMessage::request(1, "ping", None))
            .await
            .unwrap();
        let reply = reply_to(&mut session.rx, 1).await;
        assert_eq!(reply, JsonRpcMessage::response(RequestId::Number(1), json!({})));

        let pid = gateway.list_backends().await["strict"].pid.unwrap();
        crate::process::kill_pid(pid).unwrap();
        for _ in 0..100 {
            if !gateway.list_backends().await["strict"].alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        gateway
            .session_send(&session.id, JsonRpcMessage::request(2, "ping", None))
            .await
            .unwrap();
        let reply = reply_to(&mut session.rx, 2).await;
        assert_eq!(reply, JsonRpcMessage::response(RequestId::Number(2), json!({})));
        assert_eq!(gateway.list_backends().await["strict"].restart_count, 1);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_reaping_closes_abandoned_sessions() {
        let gateway = Gateway::new(GatewayConfig {
            idle_ttl: Duration::from_millis(30),
            ..fast_config()
        });
        gateway.add_backend("scratch", fake_backend()).await.unwrap();
        let watched = gateway.open_session("scratch", Transport::Socket).await.unwrap();
        let abandoned = gateway.open_session("scratch", Transport::Stream).await.unwrap();
        drop(abandoned.rx);

        // The live session keeps the backend.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(gateway.reap_idle_backends().await.is_empty());

        // Once the live session closes, the next broadcast detaches the dead queue.
        assert!(gateway.close_session(&watched.id).await);
        gateway
            .send_message("scratch", &JsonRpcMessage::request(3, "chatter", None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(gateway.reap_idle_backends().await, vec!["scratch"]);

        assert!(gateway.sessions().is_empty().await);
        let err = gateway
            .session_send(&abandoned.id, JsonRpcMessage::request(4, "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_backend_reports_fresh_process() {
        let gateway = Gateway::new(fast_config());
        let before = gateway.add_backend("time", fake_backend()).await.unwrap();
        let after = gateway.restart_backend("time").await.unwrap();
        assert_ne!(before.pid, after.pid);
        assert_eq!(after.restart_count, 1);
        assert_eq!(after.tools, 2);

        let info = gateway.open_session("time", Transport::Direct).await.unwrap();
        assert_eq!(gateway.session_info(&info.id).await.unwrap().backend, "time");
        gateway.shutdown().await;
    }
}

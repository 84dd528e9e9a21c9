//! Single-owner registry of named backends.
//!
//! Every mutation of the process map goes through this type. Each entry
//! owns exactly one [`BackendProcess`], its distributor, and its health and
//! breaker records.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::{McpRequester, ToolCatalog};
use crate::config::{BackendConfig, GatewayConfig};
use crate::distributor::{lock, DeliveryStats, MessageDistributor, PendingRequest};
use crate::error::{Error, Result};
use crate::health::{BackendHealthReport, CircuitBreaker, CircuitState, ServerHealth, ServerState};
use crate::process::BackendProcess;
use crate::protocol::{client_initialize_params, JsonRpcMessage, RequestId};

/// Which lifecycle a backend follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendGroup {
    /// Started at boot, never reclaimed.
    Popular,
    /// Added at runtime, reclaimed when idle.
    Dynamic,
}

/// Live status of one backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub name: String,
    pub group: BackendGroup,
    pub alive: bool,
    pub pid: Option<u32>,
    pub last_used: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub health: ServerState,
    pub circuit: CircuitState,
    pub failure_count: u32,
    pub tools: usize,
    pub sessions: usize,
    pub delivery: DeliveryStats,
    pub command: String,
}

struct BackendEntry {
    name: String,
    group: BackendGroup,
    process: Mutex<BackendProcess>,
    distributor: Arc<MessageDistributor>,
    health: StdMutex<ServerHealth>,
    breaker: StdMutex<CircuitBreaker>,
    discovery: Mutex<()>,
    /// Process generation that completed the handshake.
    handshaken: AtomicU32,
    /// Process generation that had its automatic handshake and discovery.
    discovered: AtomicU32,
}

/// Named backends, split into popular and dynamic groups.
pub struct BackendRegistry {
    config: GatewayConfig,
    catalog: Arc<ToolCatalog>,
    entries: RwLock<HashMap<String, Arc<BackendEntry>>>,
    retired: StdMutex<HashMap<String, ServerHealth>>,
    next_id: AtomicU64,
}

impl BackendRegistry {
    /// Create an empty registry feeding `catalog`.
    pub fn new(config: GatewayConfig, catalog: Arc<ToolCatalog>) -> Self {
        Self {
            config,
            catalog,
            entries: RwLock::new(HashMap::new()),
            retired: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn new_entry(&self, name: &str, group: BackendGroup, config: BackendConfig) -> Arc<BackendEntry> {
        let distributor = MessageDistributor::new(name, self.config.delivery);
        let process = BackendProcess::new(
            name,
            config,
            Arc::clone(&distributor),
            self.config.start_grace,
            self.config.stop_timeout,
        );
        Arc::new(BackendEntry {
            name: name.to_string(),
            group,
            process: Mutex::new(process),
            distributor,
            health: StdMutex::new(ServerHealth::new(name)),
            breaker: StdMutex::new(CircuitBreaker::new(
                self.config.breaker_threshold,
                self.config.breaker_recovery,
            )),
            discovery: Mutex::new(()),
            handshaken: AtomicU32::new(0),
            discovered: AtomicU32::new(0),
        })
    }

    async fn entry(&self, name: &str) -> Result<Arc<BackendEntry>> {
        self.entries
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BackendNotFound(name.to_string()))
    }

    fn check_dynamic_capacity(&self, entries: &HashMap<String, Arc<BackendEntry>>) -> Result<()> {
        let dynamic = entries
            .values()
            .filter(|e| e.group == BackendGroup::Dynamic)
            .count();
        if dynamic >= self.config.max_dynamic_backends {
            return Err(Error::Config(format!(
                "dynamic backend limit reached ({})",
                self.config.max_dynamic_backends
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register and start the popular backends concurrently. Returns the
    /// backends that failed to start; they stay registered for later retries.
    pub async fn start_popular(&self, configs: BTreeMap<String, BackendConfig>) -> Vec<(String, Error)> {
        let mut started = Vec::new();
        {
            let mut entries = self.entries.write().await;
            for (name, config) in configs {
                if entries.contains_key(&name) {
                    warn!(backend = %name, "backend already registered, skipping");
                    continue;
                }
                let entry = self.new_entry(&name, BackendGroup::Popular, config);
                entries.insert(name, Arc::clone(&entry));
                started.push(entry);
            }
        }

        let results = futures::future::join_all(started.iter().map(|entry| async move {
            (entry.name.clone(), self.ensure_entry(entry).await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(name, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(backend = %name, error = %e, "popular backend failed to start");
                    Some((name, e))
                }
            })
            .collect()
    }

    /// Make sure `name` is running, registering it as dynamic if unknown.
    ///
    /// A live backend is only touched. Otherwise it is (re)started, gated
    /// by its breaker, and its catalog entries are refreshed.
    pub async fn ensure(&self, name: &str, config: BackendConfig) -> Result<()> {
        config.validate()?;
        let entry = {
            let mut entries = self.entries.write().await;
            match entries.get(name) {
                Some(entry) => Arc::clone(entry),
                None => {
                    self.check_dynamic_capacity(&entries)?;
                    let entry = self.new_entry(name, BackendGroup::Dynamic, config.clone());
                    entries.insert(name.to_string(), Arc::clone(&entry));
                    lock(&self.retired).remove(name);
                    entry
                }
            }
        };
        {
            let mut process = entry.process.lock().await;
            if process.config() != &config && !process.is_alive() {
                process.set_config(config);
            }
        }
        self.ensure_entry(&entry).await
    }

    /// `ensure` for an already registered backend.
    pub async fn ensure_known(&self, name: &str) -> Result<()> {
        let entry = self.entry(name).await?;
        self.ensure_entry(&entry).await
    }

    async fn ensure_entry(&self, entry: &BackendEntry) -> Result<()> {
        self.ensure_started(entry).await.map(|_| ())
    }

    /// Start the process if it is not alive, then handshake and discover
    /// once per process generation. Returns whether a start happened.
    async fn ensure_started(&self, entry: &BackendEntry) -> Result<bool> {
        let started = {
            let mut process = entry.process.lock().await;
            if process.is_alive() {
                process.touch();
                false
            } else {
                self.start_locked(entry, &mut process).await?;
                true
            }
        };
        self.discover_if_stale(entry).await;
        Ok(started)
    }

    async fn start_locked(&self, entry: &BackendEntry, process: &mut BackendProcess) -> Result<()> {
        if !lock(&entry.breaker).can_execute() {
            debug!(backend = %entry.name, "restart blocked by open circuit");
            return Err(Error::CircuitOpen(entry.name.clone()));
        }
        match process.start().await {
            Ok(()) => {
                lock(&entry.health).mark_starting(process.pid());
                Ok(())
            }
            Err(e) => {
                self.record_failure(entry, &e);
                Err(e)
            }
        }
    }

    /// Register a dynamic backend and start it. Re-adding a dynamic name
    /// replaces its configuration and process.
    pub async fn add(&self, name: &str, config: BackendConfig) -> Result<()> {
        config.validate()?;
        let (entry, previous) = {
            let mut entries = self.entries.write().await;
            let previous = match entries.get(name).map(|e| e.group) {
                Some(BackendGroup::Popular) => {
                    return Err(Error::Config(format!("'{name}' is a popular backend")));
                }
                Some(BackendGroup::Dynamic) => entries.remove(name),
                None => {
                    self.check_dynamic_capacity(&entries)?;
                    None
                }
            };
            let entry = self.new_entry(name, BackendGroup::Dynamic, config);
            entries.insert(name.to_string(), Arc::clone(&entry));
            (entry, previous)
        };
        lock(&self.retired).remove(name);
        if let Some(previous) = previous {
            self.retire(&previous, false).await;
        }
        info!(backend = %name, "dynamic backend added");
        self.ensure_entry(&entry).await
    }

    /// Stop and forget a dynamic backend. Popular backends cannot be removed.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let entry = {
            let mut entries = self.entries.write().await;
            let group = entries
                .get(name)
                .map(|e| e.group)
                .ok_or_else(|| Error::BackendNotFound(name.to_string()))?;
            if group == BackendGroup::Popular {
                return Err(Error::InvalidParams(format!(
                    "popular backend '{name}' cannot be removed"
                )));
            }
            entries
                .remove(name)
                .ok_or_else(|| Error::BackendNotFound(name.to_string()))?
        };
        self.retire(&entry, true).await;
        info!(backend = %name, "backend removed");
        Ok(())
    }

    async fn retire(&self, entry: &BackendEntry, keep_record: bool) {
        entry.process.lock().await.stop().await;
        entry.distributor.close_all();
        if keep_record {
            self.catalog.remove_backend(&entry.name).await;
            let mut health = lock(&entry.health);
            health.mark_stopped();
            lock(&self.retired).insert(entry.name.clone(), health.clone());
        }
    }

    /// Remove every dynamic backend idle for longer than `ttl` with no
    /// attached sessions.
    ///
    /// Idleness is re-checked under the map's write lock, so a backend that
    /// was used or replaced since the scan survives.
    pub async fn cleanup_idle(&self, ttl: Duration) -> Vec<String> {
        let dynamic: Vec<Arc<BackendEntry>> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.group == BackendGroup::Dynamic)
            .cloned()
            .collect();

        let mut removed = Vec::new();
        for entry in dynamic {
            let idle_for = {
                let mut entries = self.entries.write().await;
                let current = entries
                    .get(&entry.name)
                    .is_some_and(|e| Arc::ptr_eq(e, &entry));
                if !current || entry.distributor.subscriber_count() > 0 {
                    continue;
                }
                // A held process lock means a send or start is in progress.
                let Ok(process) = entry.process.try_lock() else {
                    continue;
                };
                let idle_for = process.idle_for();
                if idle_for <= ttl {
                    continue;
                }
                drop(process);
                entries.remove(&entry.name);
                idle_for
            };
            self.retire(&entry, true).await;
            info!(backend = %entry.name, idle_secs = idle_for.as_secs(), "idle backend reclaimed");
            removed.push(entry.name.clone());
        }
        removed.sort();
        removed
    }

    /// Kill a backend found dead or wedged by the monitor. Its configuration
    /// stays registered so a later `ensure` respawns it.
    pub async fn mark_dead(&self, name: &str, reason: &str) -> Result<()> {
        let entry = self.entry(name).await?;
        entry.process.lock().await.kill().await;
        lock(&entry.health).record_failure(reason);
        warn!(backend = %name, reason, "backend marked dead");
        Ok(())
    }

    /// Stop every backend.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        futures::future::join_all(entries.iter().map(|entry| async move {
            entry.process.lock().await.stop().await;
            entry.distributor.close_all();
        }))
        .await;
        info!(count = entries.len(), "all backends stopped");
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Forward one message to a backend.
    pub async fn send(&self, name: &str, message: &JsonRpcMessage) -> Result<()> {
        let entry = self.entry(name).await?;
        self.send_on(&entry, message, self.config.message_timeout).await
    }

    /// Deliver a client message within `timeout`, with at most one restart.
    ///
    /// A dead process is restarted and handshaken before the write. A failed
    /// write kills the process; unless it was just started or the deadline
    /// has passed, it is restarted once, gated by the breaker, and the write
    /// retried.
    async fn send_on(&self, entry: &BackendEntry, message: &JsonRpcMessage, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let restarted = self.ensure_started(entry).await?;
        let error = match self.write_on(entry, message, remaining(deadline)).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if restarted || remaining(deadline).is_zero() {
            return Err(error);
        }

        warn!(backend = %entry.name, error = %error, "send failed, restarting backend");
        self.ensure_started(entry).await?;
        self.write_on(entry, message, remaining(deadline)).await
    }

    /// Write to the running process without restarting it.
    async fn write_on(&self, entry: &BackendEntry, message: &JsonRpcMessage, timeout: Duration) -> Result<()> {
        let mut process = entry.process.lock().await;
        if !process.is_alive() {
            let error = Error::Send {
                name: entry.name.clone(),
                reason: "process is not running".into(),
            };
            self.record_failure(entry, &error);
            return Err(error);
        }
        match process.write(message, timeout).await {
            Ok(()) => {
                self.record_success(entry);
                Ok(())
            }
            Err(e) => {
                self.record_failure(entry, &e);
                process.kill().await;
                Err(e)
            }
        }
    }

    fn record_success(&self, entry: &BackendEntry) {
        lock(&entry.health).record_success();
        lock(&entry.breaker).record_success();
    }

    /// Count a failure against health and breaker. Slow replies and
    /// caller mistakes do not count.
    fn record_failure(&self, entry: &BackendEntry, error: &Error) {
        if !error.is_backend_failure() {
            return;
        }
        lock(&entry.health).record_failure(error.to_string());
        lock(&entry.breaker).record_failure();
    }

    /// Send a message and wait for its reply. Messages without an id, and
    /// replies, are forwarded without waiting. The write and the wait share
    /// one deadline.
    pub async fn send_and_wait(
        &self,
        name: &str,
        message: &JsonRpcMessage,
        timeout: Duration,
    ) -> Result<Option<JsonRpcMessage>> {
        let entry = self.entry(name).await?;
        match message.id() {
            Some(id) if !message.is_response() => {
                let deadline = Instant::now() + timeout;
                let pending = entry.distributor.register_pending(id.clone())?;
                self.send_on(&entry, message, timeout).await?;
                Ok(Some(pending.wait_until(deadline, timeout).await?))
            }
            _ => {
                self.send_on(&entry, message, timeout).await?;
                Ok(None)
            }
        }
    }

    /// Issue a gateway-originated request and return its result.
    pub async fn request(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let entry = self.entry(name).await?;
        let deadline = Instant::now() + timeout;
        let (id, pending) = self.register_gateway_request(&entry)?;
        self.send_on(&entry, &JsonRpcMessage::request(id, method, params), timeout)
            .await?;
        self.result_of(&entry, method, pending.wait_until(deadline, timeout).await?)
    }

    /// Request on the running process only; used by the handshake and
    /// discovery, which must never trigger a restart themselves.
    async fn request_on(
        &self,
        entry: &BackendEntry,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let (id, pending) = self.register_gateway_request(entry)?;
        self.write_on(entry, &JsonRpcMessage::request(id, method, params), timeout)
            .await?;
        self.result_of(entry, method, pending.wait_until(deadline, timeout).await?)
    }

    fn register_gateway_request(&self, entry: &BackendEntry) -> Result<(RequestId, PendingRequest)> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = RequestId::String(format!("gateway-{n}"));
        let pending = entry.distributor.register_pending(id.clone())?;
        Ok((id, pending))
    }

    fn result_of(&self, entry: &BackendEntry, method: &str, reply: JsonRpcMessage) -> Result<Value> {
        match reply {
            JsonRpcMessage::Response { result, .. } => Ok(result),
            JsonRpcMessage::ErrorResponse { error, .. } => Err(Error::Backend {
                name: entry.name.clone(),
                code: error.code,
                message: error.message,
            }),
            other => Err(Error::Protocol(format!(
                "backend '{}' answered {method} with {other:?}",
                entry.name
            ))),
        }
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// One automatic handshake and discovery per process generation. A
    /// failed attempt is not repeated until `refresh` or the next start.
    async fn discover_if_stale(&self, entry: &BackendEntry) {
        let _guard = entry.discovery.lock().await;
        let generation = entry.process.lock().await.start_count();
        if entry.discovered.load(Ordering::SeqCst) == generation {
            return;
        }
        if let Err(e) = self.handshake_and_refresh(entry, generation).await {
            warn!(backend = %entry.name, error = %e, "handshake or discovery failed");
        }
        entry.discovered.store(generation, Ordering::SeqCst);
    }

    async fn handshake_and_refresh(&self, entry: &BackendEntry, generation: u32) -> Result<usize> {
        let timeout = self.config.discovery_timeout;
        if entry.handshaken.load(Ordering::SeqCst) != generation {
            self.request_on(entry, "initialize", Some(client_initialize_params()), timeout)
                .await?;
            self.write_on(
                entry,
                &JsonRpcMessage::notification("notifications/initialized", None),
                timeout,
            )
            .await?;
            entry.handshaken.store(generation, Ordering::SeqCst);
            debug!(backend = %entry.name, generation, "handshake complete");
        }

        let requester = EntryRequester {
            registry: self,
            entry,
            timeout,
        };
        self.catalog.refresh(&entry.name, &requester).await
    }

    /// Ensure a backend is running and re-run its discovery.
    pub async fn refresh(&self, name: &str) -> Result<usize> {
        let entry = self.entry(name).await?;
        self.ensure_entry(&entry).await?;
        let _guard = entry.discovery.lock().await;
        let generation = entry.process.lock().await.start_count();
        let count = self.handshake_and_refresh(&entry, generation).await?;
        entry.discovered.store(generation, Ordering::SeqCst);
        Ok(count)
    }

    /// Stop and start a backend, then handshake and rediscover its tools.
    /// Attached sessions stay subscribed; a restart is still subject to an
    /// open breaker.
    pub async fn restart(&self, name: &str) -> Result<usize> {
        let entry = self.entry(name).await?;
        let _guard = entry.discovery.lock().await;
        let generation = {
            let mut process = entry.process.lock().await;
            process.stop().await;
            self.start_locked(&entry, &mut process).await?;
            process.start_count()
        };
        info!(backend = %name, generation, "backend restarted");
        entry.discovered.store(generation, Ordering::SeqCst);
        self.handshake_and_refresh(&entry, generation).await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Whether a backend is registered.
    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    /// Registered names.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Distributor of a backend.
    pub async fn distributor(&self, name: &str) -> Result<Arc<MessageDistributor>> {
        Ok(Arc::clone(&self.entry(name).await?.distributor))
    }

    /// Status of one backend.
    pub async fn status_of(&self, name: &str) -> Result<BackendStatus> {
        let entry = self.entry(name).await?;
        let tools = self
            .catalog
            .capabilities(name)
            .await
            .map_or(0, |caps| caps.tools.len());
        Ok(self.status_for(&entry, tools).await)
    }

    /// Status of every backend.
    pub async fn status(&self) -> BTreeMap<String, BackendStatus> {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        let counts = self.catalog.tool_counts().await;
        let mut out = BTreeMap::new();
        for entry in entries {
            let tools = counts.get(&entry.name).copied().unwrap_or(0);
            out.insert(entry.name.clone(), self.status_for(&entry, tools).await);
        }
        out
    }

    async fn status_for(&self, entry: &BackendEntry, tools: usize) -> BackendStatus {
        let mut process = entry.process.lock().await;
        let (health, failure_count) = {
            let health = lock(&entry.health);
            (health.state, health.failure_count)
        };
        BackendStatus {
            name: entry.name.clone(),
            group: entry.group,
            alive: process.is_alive(),
            pid: process.pid(),
            last_used: process.last_used(),
            started_at: process.started_at(),
            restart_count: process.restart_count(),
            health,
            circuit: lock(&entry.breaker).state(),
            failure_count,
            tools,
            sessions: entry.distributor.subscriber_count(),
            delivery: entry.distributor.stats(),
            command: process.config().command_line(),
        }
    }

    /// Health of every backend, removed ones included.
    pub async fn health_reports(&self) -> BTreeMap<String, BackendHealthReport> {
        let mut reports = BTreeMap::new();
        {
            let retired = lock(&self.retired);
            let closed = CircuitBreaker::new(self.config.breaker_threshold, self.config.breaker_recovery);
            for (name, health) in retired.iter() {
                reports.insert(name.clone(), BackendHealthReport::new(health, &closed));
            }
        }
        for entry in self.entries.read().await.values() {
            let health = lock(&entry.health);
            let breaker = lock(&entry.breaker);
            reports.insert(entry.name.clone(), BackendHealthReport::new(&health, &breaker));
        }
        reports
    }

    /// Pids of every process handle currently held.
    pub async fn tracked_pids(&self) -> Vec<(String, u32)> {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        let mut pids = Vec::new();
        for entry in entries {
            let process = entry.process.lock().await;
            if let Some(pid) = process.pid() {
                pids.push((entry.name.clone(), pid));
            }
        }
        pids
    }

    /// Command lines of every registered backend.
    pub async fn launch_patterns(&self) -> Vec<String> {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        let mut patterns = Vec::new();
        for entry in entries {
            patterns.push(entry.process.lock().await.config().command_line());
        }
        patterns
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Routes catalog discovery calls through one registry entry.
struct EntryRequester<'a> {
    registry: &'a BackendRegistry,
    entry: &'a BackendEntry,
    timeout: Duration,
}

#[async_trait]
impl McpRequester for EntryRequester<'_> {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.registry
            .request_on(self.entry, method, params, self.timeout)
            .await
    }
}

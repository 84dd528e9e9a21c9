//! Backend and gateway configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Command-line fragments that identify MCP backend processes in the OS
/// process table.
pub const DEFAULT_ORPHAN_PATTERNS: &[&str] = &[
    "mcp-server",
    "tavily-mcp",
    "server-sequential-thinking",
    "mcp-server-time",
    "server-everything",
    "dynamic-tool-retriever",
];

/// Launch configuration for one stdio backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Executable to run.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables merged over the gateway's own environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Disabled backends are skipped at boot.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl BackendConfig {
    /// Create a config for a command with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            enabled: true,
        }
    }

    /// Set the arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Command and arguments joined by spaces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Reject configs that cannot possibly launch.
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::Config("backend command is empty".into()));
        }
        Ok(())
    }
}

/// The conventional `{"mcpServers": {...}}` configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersFile {
    /// Backends by name.
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, BackendConfig>,
}

impl McpServersFile {
    /// Parse a document.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: Self = serde_json::from_str(text)?;
        for (name, config) in &file.servers {
            config
                .validate()
                .map_err(|e| Error::Config(format!("backend '{name}': {e}")))?;
        }
        Ok(file)
    }

    /// Load a document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Enabled backends only.
    pub fn enabled(self) -> BTreeMap<String, BackendConfig> {
        self.servers
            .into_iter()
            .filter(|(_, config)| config.enabled)
            .collect()
    }
}

/// How backend messages reach sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Every message goes to every session of the backend.
    #[default]
    Broadcast,
    /// Replies go only to the session that issued the request.
    Owned,
}

/// Gateway tuning knobs.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Dynamic backends idle longer than this are removed.
    pub idle_ttl: Duration,
    /// How often the idle reaper runs.
    pub cleanup_interval: Duration,
    /// Consecutive failures before the breaker opens.
    pub breaker_threshold: u32,
    /// Cooldown before an open breaker allows a trial.
    pub breaker_recovery: Duration,
    /// Process health and orphan scan interval.
    pub monitor_interval: Duration,
    /// Deadline for a single forwarded message.
    pub message_timeout: Duration,
    /// Deadline for `tools/call`.
    pub tool_timeout: Duration,
    /// Deadline for handshake and discovery calls.
    pub discovery_timeout: Duration,
    /// A process exiting within this window fails its start.
    pub start_grace: Duration,
    /// Wait after SIGTERM before killing.
    pub stop_timeout: Duration,
    /// Bounded inbound queue per session.
    pub session_queue_capacity: usize,
    /// Sessions with no client activity for this long are destroyed.
    pub session_idle_timeout: Duration,
    /// Event-stream heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Upper bound on runtime-added backends.
    pub max_dynamic_backends: usize,
    /// Session delivery semantics.
    pub delivery: DeliveryMode,
    /// Command-line fragments identifying backend processes.
    pub orphan_patterns: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
            breaker_threshold: 5,
            breaker_recovery: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(60),
            message_timeout: Duration::from_secs(10),
            tool_timeout: Duration::from_secs(60),
            discovery_timeout: Duration::from_secs(30),
            start_grace: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(5),
            session_queue_capacity: 256,
            session_idle_timeout: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(30),
            max_dynamic_backends: 20,
            delivery: DeliveryMode::Broadcast,
            orphan_patterns: DEFAULT_ORPHAN_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

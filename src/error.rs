//! Error types for the gateway.

use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the gateway.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend process could not be spawned or exited during its grace window.
    #[error("backend '{name}' failed to start: {reason}")]
    ProcessStart { name: String, reason: String },

    /// Write to a dead or unreachable backend.
    #[error("send to backend '{name}' failed: {reason}")]
    Send { name: String, reason: String },

    /// No correlated reply within the deadline.
    #[error("no response from backend '{name}' within {timeout_ms}ms")]
    ResponseTimeout { name: String, timeout_ms: u64 },

    /// Malformed or non JSON-RPC message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unknown backend name.
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// Unknown qualified tool name.
    #[error("tool not found: {name}")]
    ToolNotFound {
        name: String,
        suggestions: Vec<String>,
    },

    /// Restart blocked by the circuit breaker.
    #[error("circuit open for backend '{0}'")]
    CircuitOpen(String),

    /// Message for a session that no longer exists.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// JSON-RPC error object returned by a backend.
    #[error("backend '{name}' returned error {code}: {message}")]
    Backend {
        name: String,
        code: i32,
        message: String,
    },

    /// Invalid parameters.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable tag reported to clients in structured error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ProcessStart { .. } => "process_start_failure",
            Error::Send { .. } => "send_failure",
            Error::ResponseTimeout { .. } => "response_timeout",
            Error::Protocol(_) => "protocol_parse_error",
            Error::BackendNotFound(_) => "backend_not_found",
            Error::ToolNotFound { .. } => "tool_not_found",
            Error::CircuitOpen(_) => "circuit_open",
            Error::SessionNotFound(_) => "session_not_found",
            Error::Backend { .. } => "backend_error",
            Error::InvalidParams(_) => "invalid_params",
            Error::Config(_) => "config_error",
            Error::Serialization(_) => "serialization_error",
            Error::Io(_) => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether the error counts against a backend's health.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Error::ProcessStart { .. } | Error::Send { .. })
    }
}

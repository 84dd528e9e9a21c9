//! The gateway as an MCP server on its own stdio.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::protocol::{
    error_codes, JsonRpcMessage, RequestId, ServerCapabilities, ServerInfo, ToolCapabilities,
    PROTOCOL_VERSION,
};
use crate::tools::ToolRegistry;

/// Gateway MCP server.
pub struct GatewayMcpServer {
    /// Tool registry.
    registry: ToolRegistry,
    /// Server info.
    server_info: ServerInfo,
    /// Whether the client completed the handshake.
    initialized: bool,
}

impl GatewayMcpServer {
    /// Create a server over a running gateway.
    pub fn new(gateway: Gateway) -> Self {
        Self {
            registry: ToolRegistry::new(gateway),
            server_info: ServerInfo::default(),
            initialized: false,
        }
    }

    /// Serve newline-delimited JSON-RPC on stdin/stdout until stdin closes.
    pub async fn run_stdio(&mut self) -> Result<()> {
        info!("Starting gateway MCP server on stdio");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            debug!("Received: {}", line);

            let Some(response) = self.handle_message(&line).await else {
                continue;
            };
            let response = response.to_line()?;
            debug!("Sending: {}", response.trim_end());

            stdout.write_all(response.as_bytes()).await?;
            stdout.flush().await?;
        }

        info!("stdin closed, gateway MCP server stopping");
        Ok(())
    }

    /// Handle one incoming line. Notifications and stray responses produce
    /// no reply.
    pub async fn handle_message(&mut self, message: &str) -> Option<JsonRpcMessage> {
        let message = match JsonRpcMessage::parse(message) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                return Some(JsonRpcMessage::error(
                    None,
                    error_codes::PARSE_ERROR,
                    e.to_string(),
                ));
            }
        };

        match message {
            JsonRpcMessage::Request { id, method, params } => {
                let params = params.unwrap_or_else(|| json!({}));
                Some(self.handle_request(id, &method, params).await)
            }
            JsonRpcMessage::Notification { method, .. } => {
                if method == "notifications/initialized" || method == "initialized" {
                    self.initialized = true;
                    info!("MCP client initialized");
                } else {
                    debug!(%method, "ignoring notification");
                }
                None
            }
            JsonRpcMessage::Response { .. } | JsonRpcMessage::ErrorResponse { .. } => None,
        }
    }

    async fn handle_request(&mut self, id: RequestId, method: &str, params: Value) -> JsonRpcMessage {
        match method {
            "initialize" => self.handle_initialize(id),
            "tools/list" => JsonRpcMessage::response(id, json!({"tools": self.registry.definitions()})),
            "tools/call" => self.handle_tools_call(id, params).await,
            "ping" => JsonRpcMessage::response(id, json!({})),
            _ => JsonRpcMessage::error(
                Some(id),
                error_codes::METHOD_NOT_FOUND,
                format!("unknown method: {method}"),
            ),
        }
    }

    fn handle_initialize(&self, id: RequestId) -> JsonRpcMessage {
        info!("Initializing MCP server");

        let capabilities = ServerCapabilities {
            tools: Some(ToolCapabilities { list_changed: false }),
        };

        JsonRpcMessage::response(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": capabilities,
                "serverInfo": self.server_info
            }),
        )
    }

    async fn handle_tools_call(&self, id: RequestId, params: Value) -> JsonRpcMessage {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcMessage::error(Some(id), error_codes::INVALID_PARAMS, "missing tool name");
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        info!("Calling tool: {}", name);

        let outcome = match self.registry.execute(name, arguments).await {
            Ok(result) => serde_json::to_value(result).map_err(Error::from),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => JsonRpcMessage::response(id, result),
            Err(e) => {
                error!("Tool execution failed: {}", e);
                let code = match e {
                    Error::InvalidParams(_) | Error::BackendNotFound(_) => error_codes::INVALID_PARAMS,
                    _ => error_codes::INTERNAL_ERROR,
                };
                JsonRpcMessage::error(Some(id), code, e.to_string())
            }
        }
    }
}

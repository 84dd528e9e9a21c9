//! MCP protocol definitions.
//!
//! Backend traffic is decoded once into [`JsonRpcMessage`] at the stdio
//! boundary and stays typed from there on.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// JSON-RPC version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision the gateway negotiates with its backends.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Request identifier. `42` and `"42"` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl RequestId {
    /// Convert a raw JSON id. Floats, booleans and structured values are rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    /// JSON form of the id.
    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::from(*n),
            RequestId::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for RequestId {
    /// Renders the JSON text, so string ids keep their quotes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{}", Value::String(s.clone())),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        RequestId::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

/// MCP error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpError {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    /// Create an error object without data.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Standard JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// One JSON-RPC 2.0 message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Call expecting a reply.
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// Fire-and-forget call.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Successful reply.
    Response { id: RequestId, result: Value },
    /// Error reply. The id is absent when the peer could not read the request.
    ErrorResponse {
        id: Option<RequestId>,
        error: McpError,
    },
}

impl JsonRpcMessage {
    /// Build a request.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    /// Build a success reply.
    pub fn response(id: RequestId, result: Value) -> Self {
        Self::Response { id, result }
    }

    /// Build an error reply.
    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self::ErrorResponse {
            id,
            error: McpError::new(code, message),
        }
    }

    /// Parse one line of wire text.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| Error::Protocol(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Classify an already decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(Error::Protocol("message is not a JSON object".into()));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(Error::Protocol("missing or unsupported jsonrpc version".into()));
        }

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                RequestId::from_value(&raw)
                    .ok_or_else(|| Error::Protocol(format!("invalid id: {raw}")))?,
            ),
        };
        let params = obj.remove("params");

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(Error::Protocol("method must be a string".into()));
            };
            return Ok(match id {
                Some(id) => Self::Request { id, method, params },
                None => Self::Notification { method, params },
            });
        }

        if let Some(error) = obj.remove("error") {
            let error: McpError = serde_json::from_value(error)
                .map_err(|e| Error::Protocol(format!("invalid error object: {e}")))?;
            return Ok(Self::ErrorResponse { id, error });
        }

        match (id, obj.remove("result")) {
            (Some(id), Some(result)) => Ok(Self::Response { id, result }),
            (None, Some(_)) => Err(Error::Protocol("response without id".into())),
            _ => Err(Error::Protocol(
                "message has neither method, result nor error".into(),
            )),
        }
    }

    /// Wire form. `id` is written first.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        if let Some(id) = self.id() {
            obj.insert("id".into(), id.to_value());
        } else if matches!(self, Self::ErrorResponse { .. }) {
            obj.insert("id".into(), Value::Null);
        }
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            Self::Request { method, params, .. } | Self::Notification { method, params } => {
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { result, .. } => {
                obj.insert("result".into(), result.clone());
            }
            Self::ErrorResponse { error, .. } => {
                obj.insert("error".into(), json!(error));
            }
        }
        Value::Object(obj)
    }

    /// Serialize as a single newline-terminated frame.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(&self.to_json())?;
        line.push('\n');
        Ok(line)
    }

    /// The id, if the message carries one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::ErrorResponse { id, .. } => id.as_ref(),
            Self::Notification { .. } => None,
        }
    }

    /// The method, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            _ => None,
        }
    }

    /// The params, for requests and notifications.
    pub fn params(&self) -> Option<&Value> {
        match self {
            Self::Request { params, .. } | Self::Notification { params, .. } => params.as_ref(),
            _ => None,
        }
    }

    /// Whether this is a reply (success or error).
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. } | Self::ErrorResponse { .. })
    }

    /// Copy of the message carrying a different id. Notifications are returned unchanged.
    pub fn with_id(&self, new_id: RequestId) -> Self {
        match self {
            Self::Request { method, params, .. } => Self::Request {
                id: new_id,
                method: method.clone(),
                params: params.clone(),
            },
            Self::Response { result, .. } => Self::Response {
                id: new_id,
                result: result.clone(),
            },
            Self::ErrorResponse { error, .. } => Self::ErrorResponse {
                id: Some(new_id),
                error: error.clone(),
            },
            Self::Notification { .. } => self.clone(),
        }
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Params the gateway sends in its own `initialize` requests.
pub fn client_initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Tool definition for MCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for input parameters.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Tool call result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Content items in the result.
    pub content: Vec<ContentItem>,
    /// Whether this is an error result.
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Single text item result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: false,
        }
    }

    /// Pretty-printed JSON as a single text item.
    pub fn json(value: &Value) -> Result<Self> {
        Ok(Self::text(serde_json::to_string_pretty(value)?))
    }

    /// Error result with a message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(message)],
            is_error: true,
        }
    }
}

/// Content item in tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentItem {
    /// Text content.
    #[serde(rename = "text")]
    Text { text: String },
}

impl ContentItem {
    /// Create a text content item.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Server capabilities for initialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tool capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolCapabilities>,
}

/// Tool-related capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCapabilities {
    /// Whether list_changed notifications are supported.
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

/// Server information for initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

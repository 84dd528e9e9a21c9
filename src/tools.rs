//! Meta-tools the gateway offers when it runs as an MCP server itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::protocol::{ToolCallResult, ToolDefinition};

/// Tool trait for implementing MCP tools.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult>;
}

/// Context passed to tools during execution.
pub struct ToolContext {
    pub gateway: Gateway,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    context: Arc<ToolContext>,
}

impl ToolRegistry {
    /// Create a registry with the gateway tools.
    pub fn new(gateway: Gateway) -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
            context: Arc::new(ToolContext { gateway }),
        };
        registry.register_default_tools();
        registry
    }

    fn register_default_tools(&mut self) {
        self.register(Arc::new(ListToolsTool));
        self.register(Arc::new(CallToolTool));
        self.register(Arc::new(ListBackendsTool));
        self.register(Arc::new(AddBackendTool));
        self.register(Arc::new(RemoveBackendTool));
        self.register(Arc::new(HealthTool));
    }

    /// Register a tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, tool);
    }

    /// All tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::InvalidParams(format!("unknown tool: {name}")))?;

        tool.execute(arguments, &self.context).await
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))
}

fn no_arguments() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

// =============================================================================
// Tool Implementations
// =============================================================================

/// Lists every discovered backend tool.
pub struct ListToolsTool;

#[async_trait::async_trait]
impl Tool for ListToolsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "gateway_list_tools".into(),
            description: "List every tool offered by the gateway's backends, by qualified name (backend.tool).".into(),
            input_schema: no_arguments(),
        }
    }

    async fn execute(&self, _arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let tools = context.gateway.list_tools().await;
        if tools.is_empty() {
            return Ok(ToolCallResult::text("No tools discovered yet."));
        }
        let text = tools
            .iter()
            .map(|t| format!("- `{}`: {}", t.qualified_name, t.description))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolCallResult::text(format!("# Backend Tools\n\n{text}")))
    }
}

/// Routes a call to a backend tool.
pub struct CallToolTool;

#[derive(Debug, Deserialize)]
struct CallToolArgs {
    tool: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[async_trait::async_trait]
impl Tool for CallToolTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "gateway_call_tool".into(),
            description: "Call a backend tool by qualified name. The backend is started if needed.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool": {
                        "type": "string",
                        "description": "Qualified tool name, e.g. time.get_current_time"
                    },
                    "arguments": {
                        "type": "object",
                        "description": "Arguments passed to the tool"
                    }
                },
                "required": ["tool"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: CallToolArgs = parse_args(arguments)?;
        let arguments = args.arguments.unwrap_or_else(|| json!({}));

        match context.gateway.call_tool(&args.tool, arguments).await {
            Ok(outcome) => match serde_json::from_value::<ToolCallResult>(outcome.result.clone()) {
                Ok(result) => Ok(result),
                // Content types other than text are passed on as JSON.
                Err(_) => {
                    let mut result = ToolCallResult::json(&outcome.result)?;
                    result.is_error = outcome.is_error;
                    Ok(result)
                }
            },
            Err(Error::ToolNotFound { name, suggestions }) => {
                let mut message = format!("Tool not found: {name}");
                if !suggestions.is_empty() {
                    message.push_str(&format!("\n\nDid you mean: {}", suggestions.join(", ")));
                }
                Ok(ToolCallResult::error(message))
            }
            Err(e) => Err(e),
        }
    }
}

/// Reports every backend's status.
pub struct ListBackendsTool;

#[async_trait::async_trait]
impl Tool for ListBackendsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "gateway_list_backends".into(),
            description: "List registered backends with their process, health and circuit state.".into(),
            input_schema: no_arguments(),
        }
    }

    async fn execute(&self, _arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let backends = context.gateway.list_backends().await;
        ToolCallResult::json(&serde_json::to_value(backends)?)
    }
}

/// Registers and starts a dynamic backend.
pub struct AddBackendTool;

#[derive(Debug, Deserialize)]
struct AddBackendArgs {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[async_trait::async_trait]
impl Tool for AddBackendTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "gateway_add_backend".into(),
            description: "Add a dynamic stdio backend and start it. Dynamic backends are reclaimed when idle.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Backend name"},
                    "command": {"type": "string", "description": "Executable to launch"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "env": {"type": "object", "additionalProperties": {"type": "string"}}
                },
                "required": ["name", "command"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: AddBackendArgs = parse_args(arguments)?;
        let config = args
            .env
            .into_iter()
            .fold(BackendConfig::new(args.command).with_args(args.args), |config, (k, v)| {
                config.with_env(k, v)
            });
        let status = context.gateway.add_backend(&args.name, config).await?;
        Ok(ToolCallResult::text(format!(
            "Backend `{}` started (pid {}), {} tools discovered.",
            status.name,
            status.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
            status.tools
        )))
    }
}

/// Stops and forgets a dynamic backend.
pub struct RemoveBackendTool;

#[derive(Debug, Deserialize)]
struct RemoveBackendArgs {
    name: String,
}

#[async_trait::async_trait]
impl Tool for RemoveBackendTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "gateway_remove_backend".into(),
            description: "Stop and remove a dynamic backend.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Backend name"}
                },
                "required": ["name"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: RemoveBackendArgs = parse_args(arguments)?;
        context.gateway.remove_backend(&args.name).await?;
        Ok(ToolCallResult::text(format!("Backend `{}` removed.", args.name)))
    }
}

/// Aggregate health report.
pub struct HealthTool;

#[async_trait::async_trait]
impl Tool for HealthTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "gateway_health".into(),
            description: "Get the gateway health report: per-backend health, failed and degraded backends, orphan cleanup counts.".into(),
            input_schema: no_arguments(),
        }
    }

    async fn execute(&self, _arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let health = context.gateway.system_health().await;
        let mut result = ToolCallResult::json(&serde_json::to_value(&health)?)?;
        result.is_error = !health.is_healthy();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::protocol::ContentItem;

    fn text(result: &ToolCallResult) -> &str {
        match &result.content[0] {
            ContentItem::Text { text } => text,
        }
    }

    #[test]
    fn test_default_tools_registered() {
        let registry = ToolRegistry::new(Gateway::new(GatewayConfig::default()));
        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "gateway_add_backend",
                "gateway_call_tool",
                "gateway_health",
                "gateway_list_backends",
                "gateway_list_tools",
                "gateway_remove_backend",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arguments() {
        let registry = ToolRegistry::new(Gateway::new(GatewayConfig::default()));
        assert!(matches!(
            registry.execute("nope", json!({})).await,
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            registry.execute("gateway_remove_backend", json!({})).await,
            Err(Error::InvalidParams(_))
        ));

        let result = registry
            .execute("gateway_call_tool", json!({"tool": "time.now"}))
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(text(&result).contains("time.now"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_add_then_call_through_meta_tools() {
        use crate::testing::{fake_backend, fast_config};

        let gateway = Gateway::new(fast_config());
        let registry = ToolRegistry::new(gateway.clone());
        let script = fake_backend().args[0].clone();

        let added = registry
            .execute(
                "gateway_add_backend",
                json!({"name": "time", "command": "sh", "args": [script]}),
            )
            .await
            .unwrap();
        assert!(text(&added).contains("2 tools"));

        let listed = registry.execute("gateway_list_tools", json!({})).await.unwrap();
        assert!(text(&listed).contains("`time.echo`"));

        let called = registry
            .execute("gateway_call_tool", json!({"tool": "time.echo", "arguments": {"x": 1}}))
            .await
            .unwrap();
        assert!(!called.is_error);
        assert_eq!(text(&called), "called");

        registry
            .execute("gateway_remove_backend", json!({"name": "time"}))
            .await
            .unwrap();
        assert!(gateway.list_backends().await.is_empty());
    }
}

//! Discovered capabilities of every backend.
//!
//! The catalog never talks to processes directly. Discovery goes through an
//! [`McpRequester`], which the registry implements per backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Upper bound on `tools/list` pages followed per discovery.
const MAX_PAGES: usize = 64;

/// Suggestions attached to a not-found resolution.
const MAX_SUGGESTIONS: usize = 3;

/// Issues one request against one backend.
#[async_trait]
pub trait McpRequester: Send + Sync {
    /// Send `method` and return the `result` member of the reply.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;
}

/// One discovered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    /// `backend.tool`.
    pub qualified_name: String,
    /// Owning backend.
    pub backend: String,
    /// Backend-local tool name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// One discovered resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceEntry {
    pub backend: String,
    pub uri: String,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
}

/// One discovered prompt.
#[derive(Debug, Clone, Serialize)]
pub struct PromptEntry {
    pub backend: String,
    pub name: String,
    pub description: Option<String>,
    pub arguments: Option<Value>,
}

/// Everything one backend offers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendCapabilities {
    pub tools: Vec<ToolEntry>,
    pub resources: Vec<ResourceEntry>,
    pub prompts: Vec<PromptEntry>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CatalogState {
    by_backend: BTreeMap<String, BackendCapabilities>,
    index: HashMap<String, ToolEntry>,
}

/// Flat `backend.tool` namespace over all backends.
#[derive(Default)]
pub struct ToolCatalog {
    state: RwLock<CatalogState>,
}

/// Qualified tool name.
pub fn qualify(backend: &str, tool: &str) -> String {
    format!("{backend}.{tool}")
}

impl ToolCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run discovery against one backend without touching the catalog.
    ///
    /// Tool listing is required; resources and prompts are best-effort.
    pub async fn discover(backend: &str, requester: &dyn McpRequester) -> Result<BackendCapabilities> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page = requester.request("tools/list", params).await?;
            let listed = page
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::Protocol(format!("backend '{backend}' tools/list has no tools array")))?;
            for raw in listed {
                match parse_tool(backend, raw) {
                    Some(entry) => tools.push(entry),
                    None => warn!(backend, tool = %raw, "skipping malformed tool descriptor"),
                }
            }
            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        let resources = match requester.request("resources/list", None).await {
            Ok(result) => list_of(&result, "resources")
                .iter()
                .filter_map(|r| {
                    Some(ResourceEntry {
                        backend: backend.to_string(),
                        uri: r.get("uri")?.as_str()?.to_string(),
                        name: str_field(r, "name"),
                        description: str_field(r, "description"),
                        mime_type: str_field(r, "mimeType"),
                    })
                })
                .collect(),
            Err(e) => {
                debug!(backend, error = %e, "resources/list unavailable");
                Vec::new()
            }
        };

        let prompts = match requester.request("prompts/list", None).await {
            Ok(result) => list_of(&result, "prompts")
                .iter()
                .filter_map(|p| {
                    Some(PromptEntry {
                        backend: backend.to_string(),
                        name: p.get("name")?.as_str()?.to_string(),
                        description: str_field(p, "description"),
                        arguments: p.get("arguments").cloned(),
                    })
                })
                .collect(),
            Err(e) => {
                debug!(backend, error = %e, "prompts/list unavailable");
                Vec::new()
            }
        };

        Ok(BackendCapabilities {
            tools,
            resources,
            prompts,
            refreshed_at: Some(Utc::now()),
        })
    }

    /// Re-run discovery and replace the backend's entries. On failure the
    /// previous entries stay in place.
    pub async fn refresh(&self, backend: &str, requester: &dyn McpRequester) -> Result<usize> {
        let capabilities = Self::discover(backend, requester).await?;
        Ok(self.replace(backend, capabilities).await)
    }

    /// Atomically swap one backend's entries. Returns the tool count kept.
    pub async fn replace(&self, backend: &str, mut capabilities: BackendCapabilities) -> usize {
        let mut state = self.state.write().await;
        state.index.retain(|_, entry| entry.backend != backend);

        capabilities.tools.retain(|tool| {
            match state.index.get(&tool.qualified_name) {
                Some(owner) => {
                    warn!(
                        backend,
                        tool = %tool.qualified_name,
                        owner = %owner.backend,
                        "qualified tool name already taken, skipping"
                    );
                    false
                }
                None => true,
            }
        });
        // Duplicate names within one listing keep the first.
        let mut seen = std::collections::HashSet::new();
        capabilities
            .tools
            .retain(|tool| seen.insert(tool.qualified_name.clone()));

        for tool in &capabilities.tools {
            state.index.insert(tool.qualified_name.clone(), tool.clone());
        }
        let count = capabilities.tools.len();
        state.by_backend.insert(backend.to_string(), capabilities);
        info!(backend, tools = count, "catalog refreshed");
        count
    }

    /// Forget a backend's entries.
    pub async fn remove_backend(&self, backend: &str) -> usize {
        let mut state = self.state.write().await;
        state.index.retain(|_, entry| entry.backend != backend);
        state
            .by_backend
            .remove(backend)
            .map_or(0, |caps| caps.tools.len())
    }

    /// Map a qualified name to `(backend, tool)`.
    pub async fn resolve(&self, qualified_name: &str) -> Result<(String, String)> {
        let state = self.state.read().await;
        if let Some(entry) = state.index.get(qualified_name) {
            return Ok((entry.backend.clone(), entry.name.clone()));
        }
        Err(Error::ToolNotFound {
            name: qualified_name.to_string(),
            suggestions: suggest(&state.index, qualified_name),
        })
    }

    /// One entry.
    pub async fn get(&self, qualified_name: &str) -> Option<ToolEntry> {
        self.state.read().await.index.get(qualified_name).cloned()
    }

    /// All tools, sorted by qualified name.
    pub async fn list_tools(&self) -> Vec<ToolEntry> {
        let state = self.state.read().await;
        let mut tools: Vec<_> = state.index.values().cloned().collect();
        tools.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        tools
    }

    /// Capabilities of one backend.
    pub async fn capabilities(&self, backend: &str) -> Option<BackendCapabilities> {
        self.state.read().await.by_backend.get(backend).cloned()
    }

    /// Tool count per backend.
    pub async fn tool_counts(&self) -> BTreeMap<String, usize> {
        self.state
            .read()
            .await
            .by_backend
            .iter()
            .map(|(name, caps)| (name.clone(), caps.tools.len()))
            .collect()
    }

    /// Total tools.
    pub async fn len(&self) -> usize {
        self.state.read().await.index.len()
    }

    /// Whether no tools are known.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.index.is_empty()
    }
}

fn parse_tool(backend: &str, raw: &Value) -> Option<ToolEntry> {
    let name = raw.get("name")?.as_str()?.to_string();
    Some(ToolEntry {
        qualified_name: qualify(backend, &name),
        backend: backend.to_string(),
        description: str_field(raw, "description").unwrap_or_default(),
        input_schema: raw
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object"})),
        name,
    })
}

fn list_of<'a>(result: &'a Value, key: &str) -> &'a [Value] {
    result
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn suggest(index: &HashMap<String, ToolEntry>, wanted: &str) -> Vec<String> {
    let wanted = wanted.to_lowercase();
    let tail = wanted.rsplit('.').next().unwrap_or(&wanted).to_string();
    let mut hits: Vec<&String> = index
        .keys()
        .filter(|name| {
            let name = name.to_lowercase();
            name.contains(&wanted)
                || wanted.contains(&name)
                || (!tail.is_empty() && name.contains(&tail))
        })
        .collect();
    hits.sort();
    hits.into_iter().take(MAX_SUGGESTIONS).cloned().collect()
}

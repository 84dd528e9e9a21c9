//! Gateway MCP Server
//!
//! This crate fronts a fleet of stdio MCP servers ("backends") with a single
//! gateway. It:
//!
//! - Launches backends as child processes and restarts them on failure
//! - Correlates JSON-RPC replies with waiting callers and fans backend
//!   output out to client sessions
//! - Discovers every backend's tools into one `backend.tool` namespace
//! - Tracks backend health behind a circuit breaker and reaps orphaned
//!   processes
//! - Reclaims idle runtime-added backends
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │        HTTP / WebSocket / event-stream clients, MCP hosts        │
//! └───────────────────────────┬─────────────────────────────────────┘
//!                             │ http.rs / server.rs
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Gateway                                 │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐   │
//! │  │ Backend    │ │ Tool       │ │ Session    │ │ Process    │   │
//! │  │ Registry   │ │ Catalog    │ │ Manager    │ │ Monitor    │   │
//! │  └─────┬──────┘ └────────────┘ └────────────┘ └────────────┘   │
//! └────────┼────────────────────────────────────────────────────────┘
//!          │ one BackendProcess + MessageDistributor per backend
//!          ▼
//! ┌───────────────┐ ┌───────────────┐ ┌───────────────┐
//! │  popular      │ │  popular      │ │  dynamic      │
//! │  (always on)  │ │  (always on)  │ │  (idle TTL)   │
//! └───────────────┘ └───────────────┘ └───────────────┘
//!      newline-delimited JSON-RPC over stdin/stdout
//! ```
//!
//! # Meta-tools (stdio mode)
//!
//! | Tool | Description |
//! |------|-------------|
//! | `gateway_list_tools` | List every backend tool by qualified name |
//! | `gateway_call_tool` | Call a backend tool |
//! | `gateway_list_backends` | Backend process, health and circuit state |
//! | `gateway_add_backend` | Add and start a dynamic backend |
//! | `gateway_remove_backend` | Stop and remove a dynamic backend |
//! | `gateway_health` | Aggregate health report |

pub mod catalog;
pub mod config;
pub mod distributor;
pub mod error;
pub mod gateway;
pub mod health;
#[cfg(feature = "http")]
pub mod http;
pub mod monitor;
pub mod process;
pub mod protocol;
pub mod registry;
#[cfg(feature = "stdio")]
pub mod server;
pub mod session;
#[cfg(feature = "stdio")]
pub mod tools;

#[cfg(test)]
mod testing;

pub use catalog::{ToolCatalog, ToolEntry};
pub use config::{BackendConfig, DeliveryMode, GatewayConfig, McpServersFile};
pub use error::{Error, Result};
pub use gateway::{Gateway, RetrievedTool, ToolCallOutcome};
pub use health::{CircuitState, ServerState, SystemHealth};
pub use protocol::{JsonRpcMessage, RequestId};
pub use registry::{BackendRegistry, BackendStatus};
#[cfg(feature = "stdio")]
pub use server::GatewayMcpServer;
pub use session::Transport;

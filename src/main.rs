//! Gateway MCP - one front door for many stdio MCP servers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use embeddenator_gateway_mcp::{DeliveryMode, Gateway, GatewayConfig, McpServersFile};

/// Gateway MCP - manages stdio MCP backends behind HTTP, streaming and socket transports.
#[derive(Parser, Debug)]
#[command(name = "gateway-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind.
    #[arg(long, env = "GATEWAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind.
    #[arg(long, env = "GATEWAY_PORT", default_value_t = 8000)]
    port: u16,

    /// `{"mcpServers": {...}}` file listing the popular backends.
    #[arg(long, env = "MCP_SERVERS_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds before an idle dynamic backend is removed.
    #[arg(long, env = "SERVER_IDLE_TIMEOUT", default_value_t = 600)]
    idle_ttl: u64,

    /// Seconds between health checks and orphan scans.
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", default_value_t = 60)]
    health_interval: u64,

    /// Consecutive failures that open a backend's circuit.
    #[arg(long, default_value_t = 5)]
    breaker_threshold: u32,

    /// Seconds an open circuit waits before allowing a trial.
    #[arg(long, default_value_t = 60)]
    breaker_recovery: u64,

    /// Maximum number of dynamic backends.
    #[arg(long = "max-dynamic", env = "MAX_DYNAMIC_SERVERS", default_value_t = 20)]
    max_dynamic: usize,

    /// Require this key on every route except `/` and `/health`.
    #[arg(long, env = "GATEWAY_API_KEY")]
    api_key: Option<String>,

    /// Route each reply only to the session that sent the request.
    #[arg(long, default_value = "false")]
    owned_routing: bool,

    /// Serve the gateway itself as an MCP server on stdio instead of HTTP.
    #[arg(long, default_value = "false")]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Args {
    fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            idle_ttl: Duration::from_secs(self.idle_ttl),
            monitor_interval: Duration::from_secs(self.health_interval),
            breaker_threshold: self.breaker_threshold,
            breaker_recovery: Duration::from_secs(self.breaker_recovery),
            max_dynamic_backends: self.max_dynamic,
            delivery: if self.owned_routing {
                DeliveryMode::Owned
            } else {
                DeliveryMode::Broadcast
            },
            ..GatewayConfig::default()
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging - output to stderr to avoid interfering with MCP protocol
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("Gateway MCP starting");

    let popular = match &args.config {
        Some(path) => McpServersFile::load(path)
            .with_context(|| format!("loading backends from {}", path.display()))?
            .enabled(),
        None => BTreeMap::new(),
    };
    info!("Popular backends: {:?}", popular.keys().collect::<Vec<_>>());

    let gateway = Gateway::new(args.gateway_config());
    for (name, error) in gateway.start(popular).await {
        warn!(backend = %name, "Popular backend unavailable: {}", error);
    }

    if args.stdio {
        run_stdio(&gateway).await?;
    } else {
        let addr: SocketAddr = format!("{}:{}", args.host, args.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", args.host, args.port))?;
        run_http(&gateway, addr, args.api_key.clone()).await?;
    }

    gateway.shutdown().await;
    info!("Gateway MCP stopped");
    Ok(())
}

#[cfg(feature = "stdio")]
async fn run_stdio(gateway: &Gateway) -> anyhow::Result<()> {
    let mut server = embeddenator_gateway_mcp::GatewayMcpServer::new(gateway.clone());
    tokio::select! {
        result = server.run_stdio() => result?,
        _ = shutdown_signal() => {}
    }
    Ok(())
}

#[cfg(not(feature = "stdio"))]
async fn run_stdio(_gateway: &Gateway) -> anyhow::Result<()> {
    anyhow::bail!("built without the `stdio` feature")
}

#[cfg(feature = "http")]
async fn run_http(gateway: &Gateway, addr: SocketAddr, api_key: Option<String>) -> anyhow::Result<()> {
    embeddenator_gateway_mcp::http::serve(gateway.clone(), addr, api_key, shutdown_signal())
        .await
        .context("HTTP server failed")
}

#[cfg(not(feature = "http"))]
async fn run_http(_gateway: &Gateway, _addr: SocketAddr, _api_key: Option<String>) -> anyhow::Result<()> {
    anyhow::bail!("built without the `http` feature")
}

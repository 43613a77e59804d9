//! sandbox-api - Sandbox control service
//!
//! Exposes filesystem, process and network operations as MCP tools over a
//! WebSocket, and the same capabilities as plain HTTP routes.

pub mod args;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod http;
pub mod mcp;
pub mod path;
pub mod registry;
pub mod schema;
pub mod tools;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

pub use config::SandboxConfig;
pub use error::{ErrorKind, RegistryError, Result, SandboxError};
pub use handler::Handlers;
pub use http::{router, AppState};
pub use mcp::McpServer;
pub use registry::ToolRegistry;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire local handlers, the tool registry and the MCP server together.
pub fn build_state(config: &SandboxConfig) -> anyhow::Result<AppState> {
    let workspace = config.workspace_dir()?;
    let handlers = Handlers::local(workspace.clone(), config.port_poll_interval());
    let settings = config.tool_settings();

    let registry = tools::build_registry(&handlers, settings).context("Failed to build tool registry")?;
    info!(
        tools = registry.tool_count(),
        workspace = %workspace.display(),
        "Tool registry ready"
    );

    let http = reqwest::Client::builder()
        .timeout(CALLBACK_TIMEOUT)
        .build()
        .context("Failed to build callback HTTP client")?;

    Ok(AppState {
        handlers,
        mcp: McpServer::new(Arc::new(registry)),
        settings,
        tree_max_depth: config.tree_max_depth,
        http,
    })
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Sandbox API server failed")
}

//! HTTP / WebSocket frontend
//!
//! Binds the handlers and the MCP dispatcher to an axum router. Filesystem
//! routes carry sandbox paths in the URL and are dispatched by hand from the
//! fallback, since an absolute path arrives as a single `%2F`-prefixed
//! segment the router cannot match.

mod filesystem;
mod mcp_ws;
mod network;
mod process;

use axum::{
    extract::DefaultBodyLimit,
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::SandboxError;
use crate::handler::Handlers;
use crate::mcp::McpServer;
use crate::tools::ToolSettings;

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    pub handlers: Handlers,
    pub mcp: McpServer,
    pub settings: ToolSettings,
    pub tree_max_depth: usize,
    /// Outbound client for port-monitor callbacks.
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/process", get(process::list).post(process::execute))
        .route("/process/:id", get(process::get).delete(process::stop))
        .route("/process/:id/logs", get(process::logs))
        .route("/process/:id/logs/stream", get(process::stream_logs))
        .route("/process/:id/kill", post(process::kill).delete(process::kill))
        .route("/network/process/:pid/ports", get(network::ports))
        .route(
            "/network/process/:pid/monitor",
            post(network::monitor).delete(network::stop_monitor),
        )
        .route("/mcp", get(mcp_ws::upgrade))
        .fallback(filesystem::dispatch)
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Decode a JSON body into `T`, reporting failures as `InvalidArguments`
/// rather than axum's own rejection shape.
fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, SandboxError> {
    let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice(body).map_err(|e| SandboxError::invalid(format!("malformed JSON body: {e}")))?
    };
    serde_json::from_value(value).map_err(|e| SandboxError::invalid(e.to_string()))
}

fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "method not allowed" })),
    )
        .into_response()
}

//! Network routes. HTTP callers get their port openings POSTed back to a
//! callback URL as `{pid, port}`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{decode_body, AppState};
use crate::error::{Result, SandboxError};
use crate::handler::{PortInfo, PortOpenCallback};
use crate::tools::net::{PidMessage, ProcessPorts, MONITOR_STARTED, MONITOR_STOPPED};

#[derive(Debug, Deserialize)]
struct MonitorBody {
    callback: String,
}

fn parse_pid(raw: &str) -> Result<u32> {
    raw.parse()
        .map_err(|_| SandboxError::invalid(format!("'{raw}' is not a valid pid")))
}

fn http_callback(client: reqwest::Client, url: reqwest::Url) -> PortOpenCallback {
    Arc::new(move |pid: u32, port: PortInfo| {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            let body = json!({ "pid": pid, "port": port.port });
            match client.post(url.clone()).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(pid, port = port.port, %url, "Port callback delivered");
                }
                Ok(resp) => warn!(pid, port = port.port, %url, status = %resp.status(), "Port callback rejected"),
                Err(e) => warn!(pid, port = port.port, %url, "Port callback failed: {e}"),
            }
        });
    })
}

pub(super) async fn ports(State(state): State<AppState>, Path(pid): Path<String>) -> Result<Json<ProcessPorts>> {
    let pid = parse_pid(&pid)?;
    let ports = state.handlers.network.ports_for_pid(pid).await?;
    Ok(Json(ProcessPorts { pid, ports }))
}

pub(super) async fn monitor(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    body: Bytes,
) -> Result<Json<PidMessage>> {
    let pid = parse_pid(&pid)?;
    let body: MonitorBody = decode_body(&body)?;
    let url = reqwest::Url::parse(&body.callback)
        .map_err(|e| SandboxError::invalid(format!("invalid callback URL '{}': {e}", body.callback)))?;
    state
        .handlers
        .network
        .register_port_callback(pid, http_callback(state.http.clone(), url))
        .await?;
    Ok(Json(PidMessage::new(pid, MONITOR_STARTED)))
}

pub(super) async fn stop_monitor(State(state): State<AppState>, Path(pid): Path<String>) -> Result<Json<PidMessage>> {
    let pid = parse_pid(&pid)?;
    state.handlers.network.unregister_port_callback(pid).await;
    Ok(Json(PidMessage::new(pid, MONITOR_STOPPED)))
}

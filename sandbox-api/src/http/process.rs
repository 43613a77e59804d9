//! Process routes. `:id` is either a pid or a process name.

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::{Path, State},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::info;

use super::{decode_body, AppState};
use crate::args::ProcessArgs;
use crate::error::{Result, SandboxError};
use crate::handler::{ProcessInfo, ProcessLogs};
use crate::tools::process::{self as process_tools, ProcessAction};

async fn lookup(state: &AppState, id: &str) -> Result<ProcessInfo> {
    let process = &state.handlers.process;
    match id.parse::<u32>() {
        Ok(pid) => process.get(pid).await,
        Err(_) => process.get_by_name(id).await,
    }
}

pub(super) async fn list(State(state): State<AppState>) -> Json<Vec<ProcessInfo>> {
    Json(state.handlers.process.list().await)
}

pub(super) async fn execute(State(state): State<AppState>, body: Bytes) -> Result<Json<ProcessInfo>> {
    let args: ProcessArgs = decode_body(&body)?;
    if args.wait_for_ports.iter().flatten().any(|&port| port == 0) {
        return Err(SandboxError::invalid("waitForPorts entries must be between 1 and 65535"));
    }
    let info = process_tools::execute(
        state.handlers.process.as_ref(),
        state.handlers.network.as_ref(),
        state.settings,
        &args,
    )
    .await?;
    Ok(Json(info))
}

pub(super) async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ProcessInfo>> {
    Ok(Json(lookup(&state, &id).await?))
}

pub(super) async fn logs(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ProcessLogs>> {
    let info = lookup(&state, &id).await?;
    Ok(Json(state.handlers.process.logs(info.pid).await?))
}

/// Server-sent events: the output captured so far, then each new chunk as
/// it is written. The stream ends when the process is done for good.
pub(super) async fn stream_logs(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let info = lookup(&state, &id).await?;
    let follow = state.handlers.process.follow_logs(info.pid).await?;
    info!(pid = info.pid, "Streaming process logs");

    let live = BroadcastStream::new(follow.live).filter_map(|chunk| chunk.ok());
    let stream = tokio_stream::iter(follow.backlog).chain(live).map(|chunk| {
        Ok::<_, Infallible>(
            SseEvent::default()
                .event(chunk.stream.as_str())
                .data(serde_json::to_string(&chunk).unwrap_or_default()),
        )
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

pub(super) async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ProcessAction>> {
    let info = lookup(&state, &id).await?;
    Ok(Json(process_tools::stop(state.handlers.process.as_ref(), info.pid).await?))
}

pub(super) async fn kill(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ProcessAction>> {
    let info = lookup(&state, &id).await?;
    Ok(Json(process_tools::kill(state.handlers.process.as_ref(), info.pid).await?))
}

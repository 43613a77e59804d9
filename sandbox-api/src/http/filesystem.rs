//! Filesystem routes: file CRUD, recursive trees and change streams.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::path::{Path, PathBuf};

use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{decode_body, method_not_allowed, AppState};
use crate::args::{FsDeleteArgs, FsWriteArgs, DEFAULT_PERMISSIONS};
use crate::error::{Result, SandboxError};
use crate::path::{decode_request_path, FsRoute};
use crate::tools::{self, PathMessage};

#[derive(Debug, Default, Deserialize)]
struct FsQuery {
    #[serde(default)]
    download: bool,
    #[serde(default)]
    recursive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteBody {
    #[serde(default)]
    content: String,
    #[serde(default)]
    is_directory: bool,
    #[serde(default)]
    permissions: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeBody {
    #[serde(default)]
    files: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct WatchEvent {
    op: &'static str,
    path: String,
}

/// Fallback handler: everything under `/filesystem` and `/watch/filesystem`.
pub(super) async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let raw = req.uri().path().to_string();
    let Some((route, path)) = decode_request_path(&raw) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no route for {raw}") })),
        )
            .into_response();
    };
    let query = Query::<FsQuery>::try_from_uri(req.uri())
        .map(|q| q.0)
        .unwrap_or_default();

    let method = req.method().as_str().to_string();
    let result = match (route, method.as_str()) {
        (FsRoute::File, "GET") => read(&state, &path, &query, req.headers()).await,
        (FsRoute::File, "PUT" | "POST") => write(&state, path, req).await,
        (FsRoute::File, "DELETE") => delete(&state, path, query.recursive).await,
        (FsRoute::Tree, "GET") => tree(&state, &path).await,
        (FsRoute::Tree, "PUT") => write_tree(&state, &path, req).await,
        (FsRoute::Watch, "GET") => watch(&state, &path).await,
        _ => return method_not_allowed(),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

fn wants_octet_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/octet-stream"))
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

async fn read(state: &AppState, path: &str, query: &FsQuery, headers: &HeaderMap) -> Result<Response> {
    let fs = &state.handlers.filesystem;
    if fs.is_directory(path).await? {
        return Ok(Json(fs.list_directory(path).await?).into_response());
    }

    if query.download || wants_octet_stream(headers) {
        let bytes = fs.read_bytes(path).await?;
        let filename = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".into());
        let headers = [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ];
        return Ok((headers, bytes).into_response());
    }

    Ok(Json(fs.read_file(path).await?).into_response())
}

async fn write(state: &AppState, path: String, req: Request) -> Result<Response> {
    if is_multipart(req.headers()) {
        let multipart = Multipart::from_request(req, state)
            .await
            .map_err(|e| SandboxError::invalid(e.body_text()))?;
        let written = upload(state, &path, multipart).await?;
        return Ok(Json(written).into_response());
    }

    let body = Bytes::from_request(req, state)
        .await
        .map_err(|e| SandboxError::invalid(e.body_text()))?;
    let body: WriteBody = decode_body(&body)?;
    let args = FsWriteArgs {
        path,
        content: body.content,
        permissions: body.permissions.unwrap_or_else(|| format!("{DEFAULT_PERMISSIONS:04o}")),
        is_directory: body.is_directory,
    };
    let written = tools::fs::write(state.handlers.filesystem.as_ref(), &args).await?;
    Ok(Json(written).into_response())
}

/// Raw upload: a `file` part plus an optional `permissions` field.
async fn upload(state: &AppState, path: &str, mut multipart: Multipart) -> Result<PathMessage> {
    let mut data: Option<Bytes> = None;
    let mut permissions = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| SandboxError::invalid(e.body_text()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                data = Some(field.bytes().await.map_err(|e| SandboxError::invalid(e.body_text()))?);
            }
            Some("permissions") => {
                permissions = field.text().await.map_err(|e| SandboxError::invalid(e.body_text()))?;
            }
            other => debug!(field = ?other, "Ignoring multipart field"),
        }
    }

    let data = data.ok_or_else(|| SandboxError::invalid("multipart body has no 'file' part"))?;
    let mode = crate::args::parse_permissions(&permissions);
    let target = state.handlers.filesystem.write_file(path, &data, mode).await?;
    info!(path = %target.display(), bytes = data.len(), "File uploaded");
    Ok(PathMessage::new(target.to_string_lossy(), tools::fs::FILE_WRITTEN))
}

async fn delete(state: &AppState, path: String, recursive: bool) -> Result<Response> {
    let args = FsDeleteArgs { path, recursive };
    let removed = tools::fs::delete(state.handlers.filesystem.as_ref(), &args).await?;
    Ok(Json(removed).into_response())
}

async fn tree(state: &AppState, path: &str) -> Result<Response> {
    let listing = state.handlers.filesystem.tree(path, state.tree_max_depth).await?;
    Ok(Json(listing).into_response())
}

async fn write_tree(state: &AppState, path: &str, req: Request) -> Result<Response> {
    let body = Bytes::from_request(req, state)
        .await
        .map_err(|e| SandboxError::invalid(e.body_text()))?;
    let body: TreeBody = decode_body(&body)?;
    let fs = &state.handlers.filesystem;
    let written = fs.write_tree(path, &body.files).await?;
    info!(root = path, files = written.len(), "Tree written");
    Ok(Json(fs.tree(path, state.tree_max_depth).await?).into_response())
}

fn watch_target(workspace: PathBuf, path: &str) -> PathBuf {
    if path.is_empty() {
        workspace
    } else if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        workspace.join(path)
    }
}

fn op_name(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Create(_) => Some("create"),
        EventKind::Modify(ModifyKind::Name(_)) => Some("rename"),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some("chmod"),
        EventKind::Modify(_) => Some("write"),
        EventKind::Remove(_) => Some("remove"),
        _ => None,
    }
}

fn watcher_error(context: &str, e: notify::Error) -> SandboxError {
    SandboxError::io(context, io::Error::other(e))
}

/// Server-sent events, one `{op, path}` object per change.
async fn watch(state: &AppState, path: &str) -> Result<Response> {
    let fs = &state.handlers.filesystem;
    let is_dir = fs.is_directory(path).await?;
    let target = watch_target(fs.working_directory(), path);

    let (tx, rx) = mpsc::unbounded_channel::<WatchEvent>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let Some(op) = op_name(&event.kind) else {
                return;
            };
            for changed in event.paths {
                let _ = tx.send(WatchEvent {
                    op,
                    path: changed.to_string_lossy().into_owned(),
                });
            }
        }
        Err(e) => warn!("Filesystem watcher error: {e}"),
    })
    .map_err(|e| watcher_error("create watcher", e))?;

    let mode = if is_dir {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher
        .watch(&target, mode)
        .map_err(|e| watcher_error(&format!("watch {}", target.display()), e))?;
    info!(path = %target.display(), "Watching for changes");

    // The watcher lives as long as the stream; dropping either ends both.
    let stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let _ = &watcher;
        Ok::<_, Infallible>(
            SseEvent::default()
                .event(event.op)
                .data(serde_json::to_string(&event).unwrap_or_default()),
        )
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

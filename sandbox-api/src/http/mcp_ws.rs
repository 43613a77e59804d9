//! MCP over WebSocket. One JSON-RPC message per text frame.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::AppState;
use crate::mcp::McpServer;

const OUTBOUND_QUEUE: usize = 64;

pub(super) async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let mcp = state.mcp.clone();
    ws.on_upgrade(move |socket| handle_session(socket, mcp))
}

/// Every request frame runs on its own task; replies funnel through a
/// single writer so frames never interleave.
async fn handle_session(socket: WebSocket, mcp: McpServer) {
    info!("MCP client connected");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            if sink.send(Message::Text(reply)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("MCP socket error: {e}");
                break;
            }
        };

        let mcp = mcp.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(reply) = mcp.handle_text(&text).await {
                let _ = tx.send(reply).await;
            }
        });
    }

    // The writer drains once every in-flight request has replied.
    drop(tx);
    let _ = writer.await;
    info!("MCP client disconnected");
}

//! MCP client over the `/mcp` WebSocket.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use sandbox_api::envelope::ToolResponse;
use sandbox_api::mcp::jsonrpc::request;

use crate::client::{BASE_URL_ENV, DEFAULT_BASE_URL, REQUEST_TIMEOUT};

pub const MCP_URL_ENV: &str = "SANDBOX_API_URL";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct McpClient {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    next_id: u64,
}

/// `$SANDBOX_API_URL`, else `$API_BASE_URL`, else `http://localhost:8080`.
pub fn base_url_from_env() -> String {
    resolve_base_url(|var| std::env::var(var).ok())
}

/// Empty values count as unset.
fn resolve_base_url(lookup: impl Fn(&str) -> Option<String>) -> String {
    [MCP_URL_ENV, BASE_URL_ENV]
        .iter()
        .find_map(|var| lookup(var).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

fn websocket_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws}/mcp")
}

impl McpClient {
    pub async fn connect_from_env() -> Result<Self> {
        Self::connect(&base_url_from_env()).await
    }

    pub async fn connect(base_url: &str) -> Result<Self> {
        let url = websocket_url(base_url);
        let (socket, _) = connect_async(url.clone())
            .await
            .with_context(|| format!("Failed to connect to {url}"))?;
        let (sink, stream) = socket.split();
        Ok(Self {
            sink,
            stream,
            next_id: 1,
        })
    }

    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .context("Failed to send MCP frame")
    }

    /// Send a request frame without waiting; returns its id.
    pub async fn send_request(&mut self, method: &str, params: Value) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        self.send_text(request(id, method, params).to_string()).await?;
        Ok(id)
    }

    pub async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.send_text(frame.to_string()).await
    }

    /// Next JSON frame from the server.
    pub async fn next_frame(&mut self) -> Result<Value> {
        loop {
            let msg = tokio::time::timeout(REQUEST_TIMEOUT, self.stream.next())
                .await
                .map_err(|_| anyhow!("no MCP frame within {}s", REQUEST_TIMEOUT.as_secs()))?
                .ok_or_else(|| anyhow!("MCP connection closed"))?
                .context("MCP socket error")?;
            match msg {
                Message::Text(text) => {
                    return serde_json::from_str(&text).context("Server sent invalid JSON");
                }
                Message::Close(_) => bail!("MCP connection closed by server"),
                _ => continue,
            }
        }
    }

    /// Send a request and wait for the response carrying its id. Frames for
    /// other ids are dropped.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.send_request(method, params).await?;
        loop {
            let frame = self.next_frame().await?;
            if frame["id"] == json!(id) {
                return Ok(frame);
            }
            debug!(expected = id, got = %frame["id"], "Skipping unrelated MCP frame");
        }
    }

    /// `initialize` followed by the `notifications/initialized` notification.
    pub async fn initialize(&mut self) -> Result<Value> {
        let resp = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": sandbox_api::mcp::PROTOCOL_VERSION,
                    "clientInfo": { "name": "sandbox-integration-tests", "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": {},
                }),
            )
            .await?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(resp)
    }

    pub async fn list_tools(&mut self) -> Result<Vec<Value>> {
        let resp = self.request("tools/list", json!({})).await?;
        resp["result"]["tools"]
            .as_array()
            .cloned()
            .ok_or_else(|| anyhow!("tools/list returned no tools: {resp}"))
    }

    /// Raw `tools/call` response frame, error frames included.
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value> {
        self.request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    /// Decoded result envelope; a JSON-RPC error frame is an error.
    pub async fn call_tool_result(&mut self, name: &str, arguments: Value) -> Result<ToolResponse> {
        let frame = self.call_tool(name, arguments).await?;
        if let Some(err) = frame.get("error") {
            bail!("{name} failed: {err}");
        }
        serde_json::from_value(frame["result"].clone()).context("Malformed tool result")
    }

    /// Tool result text decoded as JSON.
    pub async fn call_tool_json(&mut self, name: &str, arguments: Value) -> Result<Value> {
        let resp = self.call_tool_result(name, arguments).await?;
        if resp.is_error {
            bail!("{name} returned an error result: {}", resp.first_text());
        }
        serde_json::from_str(resp.first_text()).with_context(|| format!("{name} result is not JSON"))
    }

    pub async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string())
    }

    #[test]
    fn test_base_url_precedence() {
        let both = env(&[("SANDBOX_API_URL", "http://mcp:1"), ("API_BASE_URL", "http://api:2")]);
        assert_eq!(resolve_base_url(both), "http://mcp:1");

        let api_only = env(&[("API_BASE_URL", "http://api:2")]);
        assert_eq!(resolve_base_url(api_only), "http://api:2");

        let empty_mcp = env(&[("SANDBOX_API_URL", ""), ("API_BASE_URL", "http://api:2")]);
        assert_eq!(resolve_base_url(empty_mcp), "http://api:2");

        assert_eq!(resolve_base_url(env(&[])), DEFAULT_BASE_URL);
    }

    #[test]
    fn test_websocket_urls() {
        assert_eq!(websocket_url("http://localhost:8080"), "ws://localhost:8080/mcp");
        assert_eq!(websocket_url("https://sandbox.example/"), "wss://sandbox.example/mcp");
        assert_eq!(websocket_url("ws://10.0.0.2:9000"), "ws://10.0.0.2:9000/mcp");
    }
}

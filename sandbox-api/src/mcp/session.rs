//! MCP method dispatch over a shared, read-only tool registry.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::jsonrpc::{Request, Response, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND};
use super::{PROTOCOL_VERSION, SERVER_NAME};
use crate::envelope::ToolResponse;
use crate::registry::ToolRegistry;

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Transport-agnostic MCP endpoint. Cloning is cheap; every clone shares
/// the same registry.
#[derive(Clone)]
pub struct McpServer {
    registry: Arc<ToolRegistry>,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Handle one text frame. Returns the serialized reply, or `None` for
    /// notifications.
    pub async fn handle_text(&self, text: &str) -> Option<String> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return encode(&Response::parse_error(e)),
        };
        let id = value.get("id").cloned();
        let request: Request = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return id.and_then(|id| {
                    encode(&Response::failure(id, INVALID_REQUEST, format!("invalid request: {e}"), None))
                });
            }
        };
        let response = self.handle(request).await?;
        encode(&response)
    }

    /// Dispatch a decoded request.
    pub async fn handle(&self, request: Request) -> Option<Response> {
        if request.is_notification() {
            debug!(method = %request.method, "Notification received");
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);

        let response = match request.method.as_str() {
            "initialize" => {
                let version = request
                    .params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(PROTOCOL_VERSION)
                    .to_string();
                Response::success(
                    id,
                    json!({
                        "protocolVersion": version,
                        "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
                        "capabilities": { "tools": {} },
                    }),
                )
            }
            "ping" => Response::success(id, json!({})),
            "tools/list" => Response::success(id, json!({ "tools": self.registry.list() })),
            "tools/call" => self.call_tool(id, request.params).await,
            other => Response::failure(id, METHOD_NOT_FOUND, format!("method not found: {other}"), None),
        };
        Some(response)
    }

    async fn call_tool(&self, id: Value, params: Value) -> Response {
        let params: CallParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return Response::failure(id, INVALID_PARAMS, format!("invalid tools/call params: {e}"), None)
            }
        };

        match self.registry.invoke(&params.name, params.arguments).await {
            Ok(resp) => Response::success(id, to_value(&resp)),
            Err(e) if e.kind().is_protocol_error() => {
                let kind = e.kind();
                Response::failure(id, kind.rpc_code(), e.to_string(), Some(json!({ "kind": kind.as_str() })))
            }
            Err(e) => Response::success(id, to_value(&ToolResponse::error(&e))),
        }
    }
}

fn to_value(resp: &ToolResponse) -> Value {
    serde_json::to_value(resp).unwrap_or(Value::Null)
}

fn encode(resp: &Response) -> Option<String> {
    match serde_json::to_string(resp) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("failed to encode JSON-RPC response: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{EmptyArgs, FsReadFileArgs};
    use crate::error::SandboxError;
    use crate::mcp::jsonrpc::{request, PARSE_ERROR};

    fn server() -> McpServer {
        let mut reg = ToolRegistry::new();
        reg.register_tool("echo", "Echo path", |a: FsReadFileArgs| async move {
            Ok(json!({ "path": a.path }))
        })
        .unwrap();
        reg.register_tool("fail", "Always conflicts", |_: EmptyArgs| async move {
            Err::<Value, _>(SandboxError::Conflict("already there".into()))
        })
        .unwrap();
        McpServer::new(Arc::new(reg))
    }

    async fn roundtrip(server: &McpServer, frame: Value) -> Value {
        let text = server.handle_text(&frame.to_string()).await.unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_reports_server_info() {
        let s = server();
        let resp = roundtrip(&s, request(1, "initialize", json!({ "protocolVersion": "2025-03-26" }))).await;
        assert_eq!(resp["result"]["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(resp["result"]["protocolVersion"], "2025-03-26");
        assert!(resp["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn test_notifications_get_no_reply() {
        let s = server();
        let frame = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        assert!(s.handle_text(&frame.to_string()).await.is_none());
    }

    #[tokio::test]
    async fn test_null_id_gets_reply() {
        let s = server();
        let frame = json!({ "jsonrpc": "2.0", "id": null, "method": "ping" });
        let resp = roundtrip(&s, frame).await;
        assert_eq!(resp["id"], Value::Null);
        assert_eq!(resp["result"], json!({}));
    }

    #[tokio::test]
    async fn test_tools_list_in_order() {
        let s = server();
        let resp = roundtrip(&s, request(2, "tools/list", Value::Null)).await;
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert_eq!(tools[0]["name"], "echo");
        assert_eq!(tools[1]["name"], "fail");
        assert_eq!(tools[0]["inputSchema"]["type"], "object");
    }

    #[tokio::test]
    async fn test_call_success_envelope() {
        let s = server();
        let resp = roundtrip(
            &s,
            request(3, "tools/call", json!({ "name": "echo", "arguments": { "path": "/a" } })),
        )
        .await;
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert_eq!(payload["path"], "/a");
        assert!(resp.get("error").is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_frame() {
        let s = server();
        let resp = roundtrip(&s, request(4, "tools/call", json!({ "name": "fsNope", "arguments": {} }))).await;
        assert!(resp.get("result").is_none());
        assert_eq!(resp["error"]["code"], INVALID_PARAMS);
        assert_eq!(resp["error"]["data"]["kind"], "UnknownTool");
    }

    #[tokio::test]
    async fn test_invalid_arguments_is_error_frame() {
        let s = server();
        let resp = roundtrip(&s, request(5, "tools/call", json!({ "name": "echo", "arguments": {} }))).await;
        assert_eq!(resp["error"]["data"]["kind"], "InvalidArguments");
    }

    #[tokio::test]
    async fn test_handler_error_is_error_result() {
        let s = server();
        let resp = roundtrip(&s, request(6, "tools/call", json!({ "name": "fail" }))).await;
        assert_eq!(resp["result"]["isError"], true);
        assert_eq!(resp["result"]["kind"], "Conflict");
        assert_eq!(resp["result"]["content"][0]["text"], "already there");
    }

    #[tokio::test]
    async fn test_unknown_method_and_garbage() {
        let s = server();
        let resp = roundtrip(&s, request(7, "resources/list", Value::Null)).await;
        assert_eq!(resp["error"]["code"], METHOD_NOT_FOUND);

        let text = s.handle_text("{not json").await.unwrap();
        let resp: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(resp["error"]["code"], PARSE_ERROR);
        assert_eq!(resp["id"], Value::Null);

        let resp = roundtrip(&s, json!({ "jsonrpc": "2.0", "id": 8 })).await;
        assert_eq!(resp["error"]["code"], INVALID_REQUEST);
    }
}

//! sandbox-integration-tests - clients for driving a running sandbox API
//!
//! `SandboxClient` speaks the HTTP surface, `McpClient` the MCP WebSocket.
//! Both default to `http://localhost:8080` and read their base URL from the
//! environment.

pub mod client;
pub mod mcp;
pub mod multipart;

pub use client::{SandboxClient, DEFAULT_BASE_URL, REQUEST_TIMEOUT};
pub use mcp::McpClient;
pub use sandbox_api::path::{encode_filesystem_path, encode_tree_path, encode_watch_path};

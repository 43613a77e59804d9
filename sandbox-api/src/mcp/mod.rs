//! MCP over JSON-RPC - method dispatch independent of the carrying transport.

pub mod jsonrpc;
pub mod session;

pub use session::McpServer;

pub const SERVER_NAME: &str = "Sandbox API Server";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

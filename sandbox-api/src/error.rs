//! Error kinds shared by handlers, the tool registry and the HTTP frontend.
//!
//! Handlers return `SandboxError`; the registry converts it into the MCP
//! error shape and the HTTP layer into a status code. Nothing is retried
//! inside the server.

use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

/// Semantic error raised by any tool or handler.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl SandboxError {
    /// Wrap an I/O error, classifying the variants callers can act on.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(format!("{context}: {source}")),
            io::ErrorKind::AlreadyExists => Self::Conflict(format!("{context}: {source}")),
            _ => Self::Io { context, source },
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTool(_) => ErrorKind::UnknownTool,
            Self::InvalidArguments(_) => ErrorKind::InvalidArguments,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Io { .. } => ErrorKind::IoFailure,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::TransportFailure,
        }
    }
}

/// Stable, wire-visible classification of a `SandboxError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownTool,
    InvalidArguments,
    NotFound,
    Conflict,
    IoFailure,
    Timeout,
    TransportFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTool => "UnknownTool",
            Self::InvalidArguments => "InvalidArguments",
            Self::NotFound => "NotFound",
            Self::Conflict => "Conflict",
            Self::IoFailure => "IOFailure",
            Self::Timeout => "Timeout",
            Self::TransportFailure => "TransportFailure",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidArguments => 400,
            Self::UnknownTool | Self::NotFound => 404,
            Self::Conflict => 409,
            Self::IoFailure => 500,
            Self::TransportFailure => 502,
            Self::Timeout => 504,
        }
    }

    /// JSON-RPC error code used when the kind is reported as an error frame.
    pub fn rpc_code(self) -> i64 {
        match self {
            Self::UnknownTool | Self::InvalidArguments => -32602,
            Self::TransportFailure => -32700,
            _ => -32603,
        }
    }

    /// Kinds that abort the call at the protocol level instead of producing
    /// an `isError` tool result.
    pub fn is_protocol_error(self) -> bool {
        matches!(self, Self::UnknownTool | Self::InvalidArguments)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures while building the tool registry at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    DuplicateTool(String),

    #[error("malformed schema for tool {tool}: {reason}")]
    MalformedSchema { tool: String, reason: String },
}

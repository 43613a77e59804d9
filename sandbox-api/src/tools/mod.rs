//! Tool families - filesystem, process and network tools bound to handlers.
//!
//! Each family exposes `register_tools`, which adds its tools to a
//! `ToolRegistry` in a fixed order.

pub mod fs;
pub mod net;
pub mod process;

use std::time::Duration;

use serde::Serialize;

use crate::error::RegistryError;
use crate::handler::Handlers;
use crate::registry::ToolRegistry;

/// Tuning knobs the tools need from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ToolSettings {
    /// `processExecute` deadline when the caller gives no `timeout`.
    pub default_timeout: Duration,
    /// Poll tick while waiting for ports.
    pub port_poll: Duration,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            port_poll: Duration::from_millis(250),
        }
    }
}

/// `{path, message}` payload of filesystem mutations.
#[derive(Debug, Clone, Serialize)]
pub struct PathMessage {
    pub path: String,
    pub message: String,
}

impl PathMessage {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Build the registry with every tool family.
pub fn build_registry(handlers: &Handlers, settings: ToolSettings) -> Result<ToolRegistry, RegistryError> {
    let mut reg = ToolRegistry::new();
    fs::register_tools(&mut reg, handlers)?;
    process::register_tools(&mut reg, handlers, settings)?;
    net::register_tools(&mut reg, handlers)?;
    Ok(reg)
}

//! Network tools.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::args::NetworkArgs;
use crate::error::RegistryError;
use crate::handler::{Handlers, PortInfo, PortOpenCallback};
use crate::registry::ToolRegistry;

pub const MONITOR_STARTED: &str = "Port monitoring started";
pub const MONITOR_STOPPED: &str = "Port monitoring stopped";

#[derive(Debug, Clone, Serialize)]
pub struct ProcessPorts {
    pub pid: u32,
    pub ports: Vec<PortInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PidMessage {
    pub pid: u32,
    pub message: String,
}

impl PidMessage {
    pub fn new(pid: u32, message: &str) -> Self {
        Self {
            pid,
            message: message.to_string(),
        }
    }
}

/// MCP callers have nowhere to be called back, so port openings are logged.
fn logging_callback() -> PortOpenCallback {
    Arc::new(|pid: u32, port: PortInfo| {
        info!(pid, port = port.port, address = %port.local_address, "Monitored process opened port");
    })
}

pub fn register_tools(reg: &mut ToolRegistry, handlers: &Handlers) -> Result<(), RegistryError> {
    let net = Arc::clone(&handlers.network);
    reg.register_tool(
        "networkGetProcessPorts",
        "List the TCP ports a process is listening on",
        move |args: NetworkArgs| {
            let net = Arc::clone(&net);
            async move {
                let ports = net.ports_for_pid(args.pid).await?;
                Ok(ProcessPorts { pid: args.pid, ports })
            }
        },
    )?;

    let net = Arc::clone(&handlers.network);
    reg.register_tool(
        "networkMonitorProcessPorts",
        "Start monitoring a process for newly opened ports",
        move |args: NetworkArgs| {
            let net = Arc::clone(&net);
            async move {
                net.register_port_callback(args.pid, logging_callback()).await?;
                Ok(PidMessage::new(args.pid, MONITOR_STARTED))
            }
        },
    )?;

    let net = Arc::clone(&handlers.network);
    reg.register_tool(
        "networkStopMonitorProcessPorts",
        "Stop monitoring a process for new ports",
        move |args: NetworkArgs| {
            let net = Arc::clone(&net);
            async move {
                net.unregister_port_callback(args.pid).await;
                Ok(PidMessage::new(args.pid, MONITOR_STOPPED))
            }
        },
    )?;

    Ok(())
}

//! Typed argument shapes, one per tool schema.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;

use crate::error::{Result, SandboxError};
use crate::schema::{ArgSchema, ParamKind, ToolArgs};

pub const DEFAULT_PERMISSIONS: u32 = 0o644;
/// Upper bound on `maxRestarts`; also what `0` stands for.
pub const MAX_RESTARTS: u32 = 25;

/// Parse an octal permission string. Unparsable input falls back to 0644.
pub fn parse_permissions(raw: &str) -> u32 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_PERMISSIONS;
    }
    match u32::from_str_radix(trimmed, 8) {
        Ok(mode) if mode <= 0o7777 => mode,
        _ => DEFAULT_PERMISSIONS,
    }
}

/// Tools without parameters.
#[derive(Debug, Default, Deserialize)]
pub struct EmptyArgs {}

impl ToolArgs for EmptyArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new()
    }
}

#[derive(Debug, Deserialize)]
pub struct FsListDirectoryArgs {
    #[serde(default)]
    pub path: String,
}

impl ToolArgs for FsListDirectoryArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new().required(
            "path",
            ParamKind::String,
            "Directory to list. Empty lists the working directory.",
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct FsReadFileArgs {
    pub path: String,
}

impl ToolArgs for FsReadFileArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new().required("path", ParamKind::String, "File to read")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsWriteArgs {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_permissions")]
    pub permissions: String,
    #[serde(default)]
    pub is_directory: bool,
}

fn default_permissions() -> String {
    "0644".into()
}

impl FsWriteArgs {
    pub fn mode(&self) -> u32 {
        parse_permissions(&self.permissions)
    }
}

impl ToolArgs for FsWriteArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new()
            .required("path", ParamKind::String, "File or directory to create")
            .optional("content", ParamKind::String, "File content, ignored for directories")
            .with_default(
                "permissions",
                ParamKind::OctalString,
                json!("0644"),
                "Octal permission bits",
            )
            .with_default(
                "isDirectory",
                ParamKind::Boolean,
                json!(false),
                "Create a directory instead of a file",
            )
    }
}

#[derive(Debug, Deserialize)]
pub struct FsDeleteArgs {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

impl ToolArgs for FsDeleteArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new()
            .required("path", ParamKind::String, "File or directory to delete")
            .with_default(
                "recursive",
                ParamKind::Boolean,
                json!(false),
                "Delete non-empty directories",
            )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessArgs {
    pub command: String,
    pub working_dir: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub wait_for_completion: bool,
    /// Seconds.
    pub timeout: Option<u64>,
    pub wait_for_ports: Option<Vec<u16>>,
    #[serde(default)]
    pub restart_on_failure: bool,
    #[serde(default)]
    pub max_restarts: u32,
}

impl ProcessArgs {
    /// Respawns allowed after a non-zero exit.
    pub fn restart_limit(&self) -> Result<u32> {
        match self.max_restarts {
            n if n > MAX_RESTARTS => Err(SandboxError::invalid(format!(
                "maxRestarts cannot exceed {MAX_RESTARTS}, got {n}"
            ))),
            _ if !self.restart_on_failure => Ok(0),
            0 => Ok(MAX_RESTARTS),
            n => Ok(n),
        }
    }
}

impl ToolArgs for ProcessArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new()
            .required("command", ParamKind::String, "Command line to run")
            .optional("workingDir", ParamKind::String, "Working directory")
            .optional("name", ParamKind::String, "Name used for later lookups")
            .optional("env", ParamKind::StringMap, "Extra environment variables")
            .with_default(
                "waitForCompletion",
                ParamKind::Boolean,
                json!(false),
                "Block until the process exits",
            )
            .optional("timeout", ParamKind::Duration, "Wait deadline in seconds")
            .optional(
                "waitForPorts",
                ParamKind::PortList,
                "Block until these ports are listening",
            )
            .with_default(
                "restartOnFailure",
                ParamKind::Boolean,
                json!(false),
                "Respawn the command when it exits non-zero",
            )
            .with_default(
                "maxRestarts",
                ParamKind::Integer,
                json!(0),
                "Restart attempts, at most 25; 0 means 25",
            )
    }
}

#[derive(Debug, Deserialize)]
pub struct ProcessNameArgs {
    pub name: String,
}

impl ToolArgs for ProcessNameArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new().required("name", ParamKind::String, "Process name")
    }
}

#[derive(Debug, Deserialize)]
pub struct ProcessIdArgs {
    pub pid: u32,
}

impl ToolArgs for ProcessIdArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new().required("pid", ParamKind::Integer, "Process id")
    }
}

#[derive(Debug, Deserialize)]
pub struct NetworkArgs {
    pub pid: u32,
}

impl ToolArgs for NetworkArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new().required("pid", ParamKind::Integer, "Process id")
    }
}

//! Handler capabilities - the contracts the sandbox backends satisfy.
//!
//! The dispatcher and the HTTP frontend only see these three traits, bundled
//! in `Handlers`. Local implementations live in the submodules.

pub mod filesystem;
pub mod network;
pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::args::ProcessArgs;
use crate::error::Result;

pub use filesystem::LocalFileSystem;
pub use network::PortObserver;
pub use process::ProcessManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub mode: String,
    pub mod_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub path: String,
    pub entries: Vec<DirEntryInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub size: u64,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    /// Relative to the listed root.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mode: String,
    pub mod_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeListing {
    pub path: String,
    pub entries: Vec<TreeEntry>,
}

/// What `delete` found and removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removed {
    Directory,
    File,
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Absolute workspace directory relative paths resolve against.
    fn working_directory(&self) -> PathBuf;

    /// `Ok(true)` for directories, `Ok(false)` for anything else that exists.
    async fn is_directory(&self, path: &str) -> Result<bool>;

    async fn list_directory(&self, path: &str) -> Result<DirectoryListing>;

    async fn read_file(&self, path: &str) -> Result<FileContent>;

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or overwrite a file; returns the resolved path.
    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<PathBuf>;

    async fn create_directory(&self, path: &str, mode: u32) -> Result<PathBuf>;

    async fn delete(&self, path: &str, recursive: bool) -> Result<Removed>;

    async fn tree(&self, path: &str, max_depth: usize) -> Result<TreeListing>;

    /// Write every `relative path -> content` pair under `root`, creating
    /// parents as needed. Returns the written paths.
    async fn write_tree(&self, root: &str, files: &HashMap<String, String>) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ExitState {
    Running,
    Exited {
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    Killed,
}

impl ExitState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command: String,
    pub working_dir: String,
    #[serde(flatten)]
    pub state: ExitState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Times the command was respawned after a failed exit.
    #[serde(default)]
    pub restarts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub stream: LogStream,
    pub data: String,
}

/// Output captured so far, then everything written after it. `live` closes
/// once the process has exited for good.
pub struct LogFollow {
    pub backlog: Vec<LogChunk>,
    pub live: broadcast::Receiver<LogChunk>,
}

#[async_trait]
pub trait Process: Send + Sync {
    /// Spawn `args.command`. Waiting for completion or ports is the
    /// caller's business; the record exists once this returns.
    async fn execute(&self, args: &ProcessArgs) -> Result<ProcessInfo>;

    async fn list(&self) -> Vec<ProcessInfo>;

    /// Also answers to the pid of any earlier attempt of a restarted process.
    async fn get(&self, pid: u32) -> Result<ProcessInfo>;

    /// Newest process spawned under `name`.
    async fn get_by_name(&self, name: &str) -> Result<ProcessInfo>;

    async fn logs(&self, pid: u32) -> Result<ProcessLogs>;

    async fn follow_logs(&self, pid: u32) -> Result<LogFollow>;

    /// Graceful termination. The record is kept.
    async fn stop(&self, pid: u32) -> Result<ProcessInfo>;

    /// Forced termination. The record is retired.
    async fn kill(&self, pid: u32) -> Result<ProcessInfo>;

    /// Wait for exit. `None` if the deadline passed first.
    async fn wait(&self, pid: u32, timeout: std::time::Duration) -> Result<Option<ProcessInfo>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub pid: u32,
    pub local_address: String,
}

/// Invoked on the observer's task for every newly seen `(pid, port)`.
pub type PortOpenCallback = Arc<dyn Fn(u32, PortInfo) + Send + Sync>;

#[async_trait]
pub trait Network: Send + Sync {
    async fn ports_for_pid(&self, pid: u32) -> Result<Vec<PortInfo>>;

    /// Replaces any callback already registered for `pid`.
    async fn register_port_callback(&self, pid: u32, callback: PortOpenCallback) -> Result<()>;

    /// Returns whether a registration was removed.
    async fn unregister_port_callback(&self, pid: u32) -> bool;
}

/// Capability bundle threaded into the registry and the HTTP frontend.
#[derive(Clone)]
pub struct Handlers {
    pub filesystem: Arc<dyn FileSystem>,
    pub process: Arc<dyn Process>,
    pub network: Arc<dyn Network>,
}

impl Handlers {
    pub fn local(workspace: PathBuf, poll_interval: std::time::Duration) -> Self {
        Self {
            filesystem: Arc::new(LocalFileSystem::new(workspace.clone())),
            process: Arc::new(ProcessManager::new(workspace)),
            network: Arc::new(PortObserver::new(poll_interval)),
        }
    }
}

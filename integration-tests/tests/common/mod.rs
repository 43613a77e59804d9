//! Shared fixtures: an in-process server on 127.0.0.1:0, or an external one
//! when `API_BASE_URL` or `SANDBOX_API_URL` is set. HTTP then goes to
//! `API_BASE_URL` and MCP to `SANDBOX_API_URL`, each falling back as the
//! clients do; an external server that never comes up exits the run with
//! status 1.

#![allow(dead_code)]

use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use sandbox_api::SandboxConfig;
use sandbox_integration_tests::client::BASE_URL_ENV;
use sandbox_integration_tests::mcp::MCP_URL_ENV;
use sandbox_integration_tests::{McpClient, SandboxClient};

fn env_set(var: &str) -> bool {
    std::env::var(var).is_ok_and(|v| !v.is_empty())
}

pub struct TestServer {
    pub base_url: String,
    /// Local workspace; `None` against an external server.
    pub workspace: Option<TempDir>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        if env_set(BASE_URL_ENV) || env_set(MCP_URL_ENV) {
            let client = SandboxClient::from_env().unwrap();
            client.wait_for_api_or_exit(30, Duration::from_millis(500)).await;
            return Self {
                base_url: client.base_url().to_string(),
                workspace: None,
                shutdown: None,
            };
        }

        let workspace = TempDir::new().unwrap();
        let config = SandboxConfig {
            workspace: Some(workspace.path().to_path_buf()),
            port_poll_interval_ms: 100,
            wait_for_ports_poll_ms: 50,
            ..SandboxConfig::default()
        };
        let state = sandbox_api::build_state(&config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(sandbox_api::serve(listener, state, async move {
            let _ = rx.await;
        }));

        let server = Self {
            base_url: format!("http://{addr}"),
            workspace: Some(workspace),
            shutdown: Some(tx),
        };
        server.client().wait_for_api(50, Duration::from_millis(20)).await.unwrap();
        server
    }

    pub fn is_local(&self) -> bool {
        self.workspace.is_some()
    }

    pub fn client(&self) -> SandboxClient {
        SandboxClient::new(self.base_url.clone()).unwrap()
    }

    /// An MCP session before the handshake.
    pub async fn mcp_connection(&self) -> McpClient {
        let connected = if self.is_local() {
            McpClient::connect(&self.base_url).await
        } else {
            McpClient::connect_from_env().await
        };
        connected.unwrap()
    }

    pub async fn mcp(&self) -> McpClient {
        let mut client = self.mcp_connection().await;
        client.initialize().await.unwrap();
        client
    }

    /// A fresh absolute directory on the server's filesystem.
    pub fn scratch_dir(&self) -> String {
        let unique = uuid::Uuid::new_v4().simple().to_string();
        match &self.workspace {
            Some(dir) => dir.path().join(format!("scratch-{unique}")).to_string_lossy().into_owned(),
            None => format!("/tmp/sandbox-it-{unique}"),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Whether `cmd` is runnable on this host.
pub fn has_command(cmd: &str) -> bool {
    std::process::Command::new(cmd)
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

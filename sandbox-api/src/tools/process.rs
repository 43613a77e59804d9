//! Process tools, including the `processExecute` wait logic.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::ToolSettings;
use crate::args::{EmptyArgs, ProcessArgs, ProcessIdArgs, ProcessNameArgs};
use crate::error::{RegistryError, Result, SandboxError};
use crate::handler::{Handlers, Network, Process, ProcessInfo};
use crate::registry::ToolRegistry;

pub const PROCESS_STOPPED: &str = "Process stopped successfully";
pub const PROCESS_KILLED: &str = "Process killed successfully";

#[derive(Debug, Clone, Serialize)]
pub struct ProcessAction {
    pub pid: u32,
    pub message: String,
    pub process: ProcessInfo,
}

/// Spawn a process and honour `waitForPorts` / `waitForCompletion`.
///
/// A zero timeout returns right after spawning. A positive timeout that
/// elapses is a `Timeout` error; the process keeps running.
pub async fn execute(
    process: &dyn Process,
    network: &dyn Network,
    settings: ToolSettings,
    args: &ProcessArgs,
) -> Result<ProcessInfo> {
    let info = process.execute(args).await?;
    let pid = info.pid;
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(settings.default_timeout);
    if timeout.is_zero() {
        return Ok(info);
    }
    let deadline = Instant::now() + timeout;

    let mut ports = Vec::new();
    if let Some(wanted) = args.wait_for_ports.as_ref().filter(|p| !p.is_empty()) {
        ports = wait_for_ports(process, network, pid, wanted, deadline, settings.port_poll).await?;
    }

    let mut current = if args.wait_for_completion {
        let remaining = deadline.saturating_duration_since(Instant::now());
        process.wait(pid, remaining).await?.ok_or_else(|| {
            SandboxError::Timeout(format!(
                "process {pid} still running after {}s",
                timeout.as_secs()
            ))
        })?
    } else {
        process.get(pid).await?
    };
    current.ports = ports;
    Ok(current)
}

async fn wait_for_ports(
    process: &dyn Process,
    network: &dyn Network,
    pid: u32,
    wanted: &[u16],
    deadline: Instant,
    poll: Duration,
) -> Result<Vec<u16>> {
    let wanted: BTreeSet<u16> = wanted.iter().copied().collect();
    loop {
        // A restarted process listens under its newest pid.
        let current = process.get(pid).await?;
        let open: BTreeSet<u16> = match network.ports_for_pid(current.pid).await {
            Ok(ports) => ports.into_iter().map(|p| p.port).collect(),
            Err(e) if e.kind() == crate::error::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e),
        };
        if wanted.is_subset(&open) {
            debug!(pid = current.pid, ?wanted, "Requested ports are listening");
            return Ok(wanted.into_iter().collect());
        }

        if !current.state.is_running() {
            return Err(SandboxError::Conflict(format!(
                "process {pid} exited before opening ports {:?}",
                wanted.difference(&open).collect::<Vec<_>>()
            )));
        }
        if Instant::now() >= deadline {
            return Err(SandboxError::Timeout(format!(
                "process {pid} did not open ports {:?} in time",
                wanted.difference(&open).collect::<Vec<_>>()
            )));
        }
        tokio::time::sleep(poll.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

pub async fn stop(process: &dyn Process, pid: u32) -> Result<ProcessAction> {
    let info = process.stop(pid).await?;
    Ok(ProcessAction {
        pid,
        message: PROCESS_STOPPED.into(),
        process: info,
    })
}

pub async fn kill(process: &dyn Process, pid: u32) -> Result<ProcessAction> {
    let info = process.kill(pid).await?;
    Ok(ProcessAction {
        pid,
        message: PROCESS_KILLED.into(),
        process: info,
    })
}

pub fn register_tools(
    reg: &mut ToolRegistry,
    handlers: &Handlers,
    settings: ToolSettings,
) -> std::result::Result<(), RegistryError> {
    let pm = Arc::clone(&handlers.process);
    reg.register_tool(
        "processesList",
        "List running and recently exited processes",
        move |_: EmptyArgs| {
            let pm = Arc::clone(&pm);
            async move { Ok(pm.list().await) }
        },
    )?;

    let pm = Arc::clone(&handlers.process);
    let net = Arc::clone(&handlers.network);
    reg.register_tool(
        "processExecute",
        "Execute a command, optionally waiting for completion or listening ports",
        move |args: ProcessArgs| {
            let pm = Arc::clone(&pm);
            let net = Arc::clone(&net);
            async move { execute(pm.as_ref(), net.as_ref(), settings, &args).await }
        },
    )?;

    let pm = Arc::clone(&handlers.process);
    reg.register_tool(
        "processGetByName",
        "Get a process by the name given at spawn",
        move |args: ProcessNameArgs| {
            let pm = Arc::clone(&pm);
            async move { pm.get_by_name(&args.name).await }
        },
    )?;

    let pm = Arc::clone(&handlers.process);
    reg.register_tool(
        "processGetLogs",
        "Get captured stdout and stderr of a process",
        move |args: ProcessIdArgs| {
            let pm = Arc::clone(&pm);
            async move { pm.logs(args.pid).await }
        },
    )?;

    let pm = Arc::clone(&handlers.process);
    reg.register_tool(
        "processStop",
        "Stop a process gracefully (SIGTERM)",
        move |args: ProcessIdArgs| {
            let pm = Arc::clone(&pm);
            async move { stop(pm.as_ref(), args.pid).await }
        },
    )?;

    let pm = Arc::clone(&handlers.process);
    reg.register_tool(
        "processKill",
        "Kill a process (SIGKILL)",
        move |args: ProcessIdArgs| {
            let pm = Arc::clone(&pm);
            async move { kill(pm.as_ref(), args.pid).await }
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::handler::ExitState;
    use crate::tools::build_registry;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Handlers, ToolRegistry) {
        let dir = TempDir::new().unwrap();
        let handlers = Handlers::local(dir.path().to_path_buf(), Duration::from_millis(100));
        let settings = ToolSettings {
            default_timeout: Duration::from_secs(10),
            port_poll: Duration::from_millis(50),
        };
        let reg = build_registry(&handlers, settings).unwrap();
        (dir, handlers, reg)
    }

    #[tokio::test]
    async fn test_spawn_and_log() {
        let (_dir, _h, reg) = setup();
        let resp = reg
            .invoke(
                "processExecute",
                json!({ "command": "echo hi", "waitForCompletion": true, "timeout": 5 }),
            )
            .await
            .unwrap();
        let info = resp.json().unwrap();
        assert_eq!(info["status"], "exited");
        assert_eq!(info["exitCode"], 0);

        let resp = reg
            .invoke("processGetLogs", json!({ "pid": info["pid"] }))
            .await
            .unwrap();
        let logs = resp.json().unwrap();
        assert_eq!(logs["stdout"], "hi\n");
        assert_eq!(logs["stderr"], "");
    }

    #[tokio::test]
    async fn test_zero_timeout_returns_immediately() {
        let (_dir, h, reg) = setup();
        let resp = reg
            .invoke(
                "processExecute",
                json!({ "command": "sleep 5", "waitForCompletion": true, "timeout": 0 }),
            )
            .await
            .unwrap();
        let info = resp.json().unwrap();
        assert_eq!(info["status"], "running");
        h.process.kill(info["pid"].as_u64().unwrap() as u32).await.unwrap();
    }

    #[tokio::test]
    async fn test_elapsed_timeout_names_pid() {
        let (_dir, h, _reg) = setup();
        let args = ProcessArgs {
            command: "sleep 5".into(),
            wait_for_completion: true,
            timeout: Some(1),
            ..Default::default()
        };
        let settings = ToolSettings::default();
        let err = execute(h.process.as_ref(), h.network.as_ref(), settings, &args)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let listed = h.process.list().await;
        let still_running = listed.iter().find(|p| p.state == ExitState::Running).unwrap();
        assert!(err.to_string().contains(&still_running.pid.to_string()));
        h.process.kill(still_running.pid).await.unwrap();
    }

    #[tokio::test]
    async fn test_background_process_is_listed_until_killed() {
        let (_dir, _h, reg) = setup();
        let resp = reg
            .invoke("processExecute", json!({ "command": "sleep 30", "name": "sleeper" }))
            .await
            .unwrap();
        let pid = resp.json().unwrap()["pid"].clone();

        let listed = reg.invoke("processesList", json!({})).await.unwrap().json().unwrap();
        assert!(listed.as_array().unwrap().iter().any(|p| p["pid"] == pid));

        let by_name = reg
            .invoke("processGetByName", json!({ "name": "sleeper" }))
            .await
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(by_name["pid"], pid);

        let killed = reg.invoke("processKill", json!({ "pid": pid })).await.unwrap().json().unwrap();
        assert_eq!(killed["message"], PROCESS_KILLED);

        let listed = reg.invoke("processesList", json!({})).await.unwrap().json().unwrap();
        assert!(!listed.as_array().unwrap().iter().any(|p| p["pid"] == pid));
    }

    #[tokio::test]
    async fn test_stop_non_running_conflicts() {
        let (_dir, _h, reg) = setup();
        let resp = reg
            .invoke(
                "processExecute",
                json!({ "command": "true", "waitForCompletion": true }),
            )
            .await
            .unwrap();
        let pid = resp.json().unwrap()["pid"].clone();
        let err = reg.invoke("processStop", json!({ "pid": pid })).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_unknown_pid_is_not_found() {
        let (_dir, _h, reg) = setup();
        let err = reg.invoke("processGetLogs", json!({ "pid": 999_999_999u32 })).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_exit_before_ports_is_reported() {
        let (_dir, _h, reg) = setup();
        let err = reg
            .invoke(
                "processExecute",
                json!({ "command": "true", "waitForPorts": [45678], "timeout": 5 }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}

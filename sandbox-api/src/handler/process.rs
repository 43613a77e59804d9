//! Process manager - spawns commands, captures their output and tracks exit
//! state.
//!
//! Each child runs in its own process group so stop/kill reach everything a
//! shell pipeline started. A supervisor task per process owns the `Child`,
//! drains stdout/stderr through two reader tasks, respawns failed commands
//! when asked to and publishes the final state on a watch channel. Output is
//! appended to the record's buffers and fanned out to log followers.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ExitState, LogChunk, LogFollow, LogStream, Process, ProcessInfo, ProcessLogs};
use crate::args::ProcessArgs;
use crate::error::{Result, SandboxError};

/// How long stop/kill wait for the child to go away before reporting.
const SIGNAL_GRACE: Duration = Duration::from_secs(5);
/// Bound on draining pipes a detached grandchild may still hold open.
const DRAIN_GRACE: Duration = Duration::from_secs(1);
/// Chunks a slow log follower may fall behind before it skips ahead.
const LOG_FEED_CAPACITY: usize = 256;

type ProcessTable = Arc<RwLock<HashMap<u32, Arc<ProcessRecord>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ExitState,
    completed_at: Option<DateTime<Utc>>,
}

struct ProcessRecord {
    /// Pid of the current attempt.
    pid: AtomicU32,
    previous_pids: Mutex<Vec<u32>>,
    seq: u64,
    name: String,
    command: String,
    working_dir: String,
    started_at: DateTime<Utc>,
    restarts: AtomicU32,
    /// Set by stop/kill so a failed exit is not respawned.
    stopping: AtomicBool,
    status: watch::Receiver<Status>,
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
    /// Dropped when the process is done for good, closing every follower.
    log_feed: Mutex<Option<broadcast::Sender<LogChunk>>>,
}

impl ProcessRecord {
    fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    fn answers_to(&self, pid: u32) -> bool {
        self.pid() == pid || lock(&self.previous_pids).contains(&pid)
    }

    fn info(&self) -> ProcessInfo {
        let status = *self.status.borrow();
        ProcessInfo {
            pid: self.pid(),
            name: self.name.clone(),
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            state: status.state,
            started_at: self.started_at,
            completed_at: status.completed_at,
            restarts: self.restarts.load(Ordering::Acquire),
            ports: Vec::new(),
        }
    }

    fn is_running(&self) -> bool {
        self.status.borrow().state.is_running()
    }

    async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.status.clone();
        let result = tokio::time::timeout(timeout, rx.wait_for(|s| !s.state.is_running())).await;
        matches!(result, Ok(Ok(_)))
    }

    fn buffer(&self, stream: LogStream) -> &Mutex<Vec<u8>> {
        match stream {
            LogStream::Stdout => &self.stdout,
            LogStream::Stderr => &self.stderr,
        }
    }

    fn feed(&self) -> Option<broadcast::Sender<LogChunk>> {
        lock(&self.log_feed).clone()
    }

    /// Append to a buffer and publish while holding its lock, so a follower
    /// sees each chunk either in its backlog or on its feed, never both.
    fn append(&self, stream: LogStream, data: &[u8], feed: Option<&broadcast::Sender<LogChunk>>) {
        let mut buffer = lock(self.buffer(stream));
        buffer.extend_from_slice(data);
        if let Some(feed) = feed {
            let _ = feed.send(LogChunk {
                stream,
                data: String::from_utf8_lossy(data).into_owned(),
            });
        }
    }

    fn follow(&self) -> LogFollow {
        let stdout = lock(&self.stdout);
        let stderr = lock(&self.stderr);
        let live = match self.feed() {
            Some(feed) => feed.subscribe(),
            None => broadcast::channel(1).1,
        };
        let backlog = [(LogStream::Stdout, &*stdout), (LogStream::Stderr, &*stderr)]
            .into_iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(stream, buffer)| LogChunk {
                stream,
                data: String::from_utf8_lossy(buffer).into_owned(),
            })
            .collect();
        LogFollow { backlog, live }
    }
}

/// Insert `record` under its current pid. A record already there belongs to
/// an exited process whose pid the kernel handed out again; it is retired.
fn install(table: &mut HashMap<u32, Arc<ProcessRecord>>, record: Arc<ProcessRecord>) -> Option<Arc<ProcessRecord>> {
    let pid = record.pid();
    let stale = table.insert(pid, record);
    if let Some(stale) = &stale {
        warn!(pid, stale = %stale.name, "PID reused, retiring stale process record");
    }
    stale
}

pub struct ProcessManager {
    workspace: PathBuf,
    processes: ProcessTable,
    next_seq: AtomicU64,
}

impl ProcessManager {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            processes: Arc::new(RwLock::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    async fn record(&self, pid: u32) -> Result<Arc<ProcessRecord>> {
        let table = self.processes.read().await;
        table
            .get(&pid)
            .or_else(|| table.values().find(|r| r.answers_to(pid)))
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("process with PID {pid} not found")))
    }

    fn resolve_dir(&self, dir: Option<&str>) -> Result<PathBuf> {
        let dir = match dir {
            None | Some("") => self.workspace.clone(),
            Some(d) if Path::new(d).is_absolute() => PathBuf::from(d),
            Some(d) => self.workspace.join(d),
        };
        if !dir.is_dir() {
            return Err(SandboxError::invalid(format!(
                "working directory {} does not exist",
                dir.display()
            )));
        }
        Ok(dir)
    }

    fn signal(pid: u32, signal: Signal) -> Result<()> {
        let group = Pid::from_raw(pid as i32);
        killpg(group, signal)
            .map_err(|e| SandboxError::io(format!("send {signal} to process {pid}"), e.into()))
    }
}

/// Commands with shell operators run under `sh -c`.
fn needs_shell(command: &str) -> bool {
    ["&&", "|", ">", "<", ";"].iter().any(|op| command.contains(op))
}

/// Split on spaces, keeping single- or double-quoted sections together.
/// A quote of the other kind inside a quoted section is literal.
fn split_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in command.chars() {
        match ch {
            '"' | '\'' => match quote {
                Some(q) if q == ch => quote = None,
                None => quote = Some(ch),
                Some(_) => current.push(ch),
            },
            ' ' if quote.is_none() => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

fn build_command(command_line: &str, working_dir: &Path, env: &HashMap<String, String>) -> Result<Command> {
    let mut cmd = if needs_shell(command_line) {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command_line);
        c
    } else {
        let argv = split_command(command_line);
        let Some((program, rest)) = argv.split_first() else {
            return Err(SandboxError::invalid("command must not be empty"));
        };
        let mut c = Command::new(program);
        c.args(rest);
        c
    };
    cmd.current_dir(working_dir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    Ok(cmd)
}

fn generate_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("proc-{}", &id[..8])
}

fn spawn_reader<R>(mut pipe: R, record: Arc<ProcessRecord>, stream: LogStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let feed = record.feed();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => record.append(stream, &buf[..n], feed.as_ref()),
            }
        }
    })
}

fn exit_state(pid: u32, waited: std::io::Result<ExitStatus>) -> ExitState {
    match waited {
        Ok(status) => match status.code() {
            Some(code) => ExitState::Exited { exit_code: code },
            None if status.signal().is_some() => ExitState::Killed,
            None => ExitState::Exited { exit_code: -1 },
        },
        Err(e) => {
            warn!(pid, "wait failed: {e}");
            ExitState::Exited { exit_code: -1 }
        }
    }
}

fn read_buffer(buffer: &Mutex<Vec<u8>>) -> String {
    String::from_utf8_lossy(&lock(buffer)).into_owned()
}

/// Owns a process from spawn to its final exit.
struct Supervisor {
    record: Arc<ProcessRecord>,
    table: ProcessTable,
    command: Command,
    status: watch::Sender<Status>,
    max_restarts: u32,
}

impl Supervisor {
    async fn run(mut self, mut child: Child) {
        let state = loop {
            let pid = self.record.pid();
            let readers = [
                child
                    .stdout
                    .take()
                    .map(|p| spawn_reader(p, Arc::clone(&self.record), LogStream::Stdout)),
                child
                    .stderr
                    .take()
                    .map(|p| spawn_reader(p, Arc::clone(&self.record), LogStream::Stderr)),
            ];
            let state = exit_state(pid, child.wait().await);
            for reader in readers.into_iter().flatten() {
                let _ = tokio::time::timeout(DRAIN_GRACE, reader).await;
            }
            debug!(pid, ?state, "Process finished");

            match self.restart(state).await {
                Some(next) => child = next,
                None => break state,
            }
        };

        lock(&self.record.log_feed).take();
        let _ = self.status.send(Status {
            state,
            completed_at: Some(Utc::now()),
        });
    }

    /// Respawn after a non-zero exit while attempts remain. The record moves
    /// to the new pid; the old one keeps resolving to it.
    async fn restart(&mut self, state: ExitState) -> Option<Child> {
        let failed = matches!(state, ExitState::Exited { exit_code } if exit_code != 0);
        let attempt = self.record.restarts.load(Ordering::Acquire) + 1;
        if !failed || attempt > self.max_restarts || self.record.stopping.load(Ordering::Acquire) {
            return None;
        }

        let old = self.record.pid();
        let notice = format!("Process restarting (attempt {attempt}/{})\n", self.max_restarts);
        self.record
            .append(LogStream::Stderr, notice.as_bytes(), self.record.feed().as_ref());

        let child = match self.command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(pid = old, "restart failed: {e}");
                return None;
            }
        };
        let new = child.id()?;

        {
            let mut table = self.table.write().await;
            if table.get(&old).is_some_and(|r| Arc::ptr_eq(r, &self.record)) {
                table.remove(&old);
            }
            lock(&self.record.previous_pids).push(old);
            self.record.pid.store(new, Ordering::Release);
            self.record.restarts.store(attempt, Ordering::Release);
            install(&mut table, Arc::clone(&self.record));
        }
        info!(pid = new, previous = old, attempt, name = %self.record.name, "Process restarted");
        Some(child)
    }
}

#[async_trait]
impl Process for ProcessManager {
    async fn execute(&self, args: &ProcessArgs) -> Result<ProcessInfo> {
        let command_line = args.command.trim();
        if command_line.is_empty() {
            return Err(SandboxError::invalid("command must not be empty"));
        }
        let max_restarts = args.restart_limit()?;
        let working_dir = self.resolve_dir(args.working_dir.as_deref())?;
        let mut command = build_command(command_line, &working_dir, &args.env)?;

        let child = command
            .spawn()
            .map_err(|e| SandboxError::io(format!("spawn '{command_line}'"), e))?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::io("spawn", std::io::Error::other("child exited before pid was read")))?;

        let (status_tx, status_rx) = watch::channel(Status {
            state: ExitState::Running,
            completed_at: None,
        });
        let (feed, _) = broadcast::channel(LOG_FEED_CAPACITY);

        let name = match &args.name {
            Some(n) if !n.is_empty() => n.clone(),
            _ => generate_name(),
        };
        let record = Arc::new(ProcessRecord {
            pid: AtomicU32::new(pid),
            previous_pids: Mutex::new(Vec::new()),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            name,
            command: command_line.to_string(),
            working_dir: working_dir.to_string_lossy().into_owned(),
            started_at: Utc::now(),
            restarts: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
            status: status_rx,
            stdout: Mutex::new(Vec::new()),
            stderr: Mutex::new(Vec::new()),
            log_feed: Mutex::new(Some(feed)),
        });
        install(&mut *self.processes.write().await, Arc::clone(&record));
        info!(pid, name = %record.name, command = %record.command, max_restarts, "Process started");

        let supervisor = Supervisor {
            record: Arc::clone(&record),
            table: Arc::clone(&self.processes),
            command,
            status: status_tx,
            max_restarts,
        };
        tokio::spawn(supervisor.run(child));

        Ok(record.info())
    }

    async fn list(&self) -> Vec<ProcessInfo> {
        let table = self.processes.read().await;
        let mut records: Vec<_> = table.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| r.info()).collect()
    }

    async fn get(&self, pid: u32) -> Result<ProcessInfo> {
        Ok(self.record(pid).await?.info())
    }

    async fn get_by_name(&self, name: &str) -> Result<ProcessInfo> {
        self.processes
            .read()
            .await
            .values()
            .filter(|r| r.name == name)
            .max_by_key(|r| r.seq)
            .map(|r| r.info())
            .ok_or_else(|| SandboxError::NotFound(format!("process with name {name} not found")))
    }

    async fn logs(&self, pid: u32) -> Result<ProcessLogs> {
        let record = self.record(pid).await?;
        Ok(ProcessLogs {
            stdout: read_buffer(&record.stdout),
            stderr: read_buffer(&record.stderr),
        })
    }

    async fn follow_logs(&self, pid: u32) -> Result<LogFollow> {
        Ok(self.record(pid).await?.follow())
    }

    async fn stop(&self, pid: u32) -> Result<ProcessInfo> {
        let record = self.record(pid).await?;
        if !record.is_running() {
            return Err(SandboxError::Conflict(format!("process {pid} is not running")));
        }
        record.stopping.store(true, Ordering::Release);
        let current = record.pid();
        Self::signal(current, Signal::SIGTERM)?;
        info!(pid = current, "Sent SIGTERM");
        if !record.wait_exit(SIGNAL_GRACE).await {
            warn!(pid = current, "Process still running after SIGTERM");
        }
        Ok(record.info())
    }

    async fn kill(&self, pid: u32) -> Result<ProcessInfo> {
        let record = self.record(pid).await?;
        if !record.is_running() {
            return Err(SandboxError::Conflict(format!("process {pid} is not running")));
        }
        record.stopping.store(true, Ordering::Release);
        let current = record.pid();
        Self::signal(current, Signal::SIGKILL)?;
        info!(pid = current, "Sent SIGKILL");
        record.wait_exit(SIGNAL_GRACE).await;

        let mut table = self.processes.write().await;
        if table.get(&current).is_some_and(|r| Arc::ptr_eq(r, &record)) {
            table.remove(&current);
        }
        Ok(record.info())
    }

    async fn wait(&self, pid: u32, timeout: Duration) -> Result<Option<ProcessInfo>> {
        let record = self.record(pid).await?;
        if record.wait_exit(timeout).await {
            Ok(Some(record.info()))
        } else {
            Ok(None)
        }
    }
}

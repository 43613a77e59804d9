//! Port discovery from `/proc` and the port-open observer.
//!
//! A pid owns a listening socket when the socket's inode shows up among the
//! fds of the pid or one of its descendants. The observer polls on a fixed
//! interval while at least one callback is registered.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{Network, PortInfo, PortOpenCallback};
use crate::error::{Result, SandboxError};

const TCP_LISTEN: &str = "0A";

/// One listening socket row from `/proc/net/tcp{,6}`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListenSocket {
    local_address: String,
    port: u16,
    inode: u64,
    protocol: &'static str,
}

fn decode_ipv4(hex: &str) -> Option<String> {
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(raw.to_le_bytes()).to_string())
}

fn decode_ipv6(hex: &str) -> Option<String> {
    if hex.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for (i, chunk) in bytes.chunks_mut(4).enumerate() {
        let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16).ok()?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Some(Ipv6Addr::from(bytes).to_string())
}

fn parse_proc_net_tcp(content: &str, protocol: &'static str) -> Vec<ListenSocket> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (addr_hex, port_hex) = fields[1].split_once(':')?;
            let local_address = if protocol == "tcp6" {
                decode_ipv6(addr_hex)?
            } else {
                decode_ipv4(addr_hex)?
            };
            Some(ListenSocket {
                local_address,
                port: u16::from_str_radix(port_hex, 16).ok()?,
                inode: fields[9].parse().ok()?,
                protocol,
            })
        })
        .collect()
}

fn listening_sockets() -> Vec<ListenSocket> {
    let mut sockets = Vec::new();
    for (file, protocol) in [("/proc/net/tcp", "tcp"), ("/proc/net/tcp6", "tcp6")] {
        match fs::read_to_string(file) {
            Ok(content) => sockets.extend(parse_proc_net_tcp(&content, protocol)),
            Err(e) => debug!("cannot read {file}: {e}"),
        }
    }
    sockets
}

/// Parent pid from the contents of `/proc/<pid>/stat`. The command name may
/// contain spaces and parentheses, so fields are counted after the last `)`.
fn parse_ppid(stat: &str) -> Option<u32> {
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().nth(1)?.parse().ok()
}

fn process_tree(root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    if let Ok(entries) = fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(ppid) = fs::read_to_string(entry.path().join("stat"))
                .ok()
                .and_then(|s| parse_ppid(&s))
            {
                children.entry(ppid).or_default().push(pid);
            }
        }
    }

    let mut tree = vec![root];
    let mut i = 0;
    while i < tree.len() {
        if let Some(kids) = children.get(&tree[i]) {
            tree.extend(kids.iter().copied().filter(|k| *k != root));
        }
        i += 1;
    }
    tree
}

fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

fn socket_inodes(pids: &[u32]) -> HashSet<u64> {
    let mut inodes = HashSet::new();
    for pid in pids {
        let Ok(fds) = fs::read_dir(format!("/proc/{pid}/fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Some(inode) = fs::read_link(fd.path())
                .ok()
                .and_then(|target| parse_socket_inode(&target.to_string_lossy()))
            {
                inodes.insert(inode);
            }
        }
    }
    inodes
}

fn pid_alive(pid: u32) -> bool {
    pid > 0 && Path::new(&format!("/proc/{pid}")).exists()
}

/// Blocking scan of the listening ports owned by `pid` and its descendants.
fn scan_ports(pid: u32) -> Vec<PortInfo> {
    let inodes = socket_inodes(&process_tree(pid));
    let mut seen = HashSet::new();
    let mut ports: Vec<PortInfo> = listening_sockets()
        .into_iter()
        .filter(|s| inodes.contains(&s.inode) && seen.insert(s.port))
        .map(|s| PortInfo {
            port: s.port,
            protocol: s.protocol.to_string(),
            state: "LISTEN".to_string(),
            pid,
            local_address: s.local_address,
        })
        .collect();
    ports.sort_by_key(|p| p.port);
    ports
}

struct Registration {
    callback: PortOpenCallback,
    seen: HashSet<u16>,
}

#[derive(Default)]
struct ObserverState {
    registrations: HashMap<u32, Registration>,
    running: bool,
}

struct ObserverInner {
    interval: Duration,
    state: RwLock<ObserverState>,
}

impl ObserverInner {
    async fn is_registered(&self, pid: u32, callback: &PortOpenCallback) -> bool {
        self.state
            .read()
            .await
            .registrations
            .get(&pid)
            .is_some_and(|reg| Arc::ptr_eq(&reg.callback, callback))
    }
}

pub struct PortObserver {
    inner: Arc<ObserverInner>,
}

impl PortObserver {
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                interval,
                state: RwLock::new(ObserverState::default()),
            }),
        }
    }

    pub async fn is_observing(&self) -> bool {
        self.inner.state.read().await.running
    }

    pub async fn monitored_pids(&self) -> Vec<u32> {
        let mut pids: Vec<_> = self.inner.state.read().await.registrations.keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

async fn observe(inner: Arc<ObserverInner>) {
    info!(interval_ms = inner.interval.as_millis() as u64, "Port observer started");
    let mut ticker = tokio::time::interval(inner.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let pids: Vec<u32> = inner.state.read().await.registrations.keys().copied().collect();
        let scanned = tokio::task::spawn_blocking(move || {
            pids.into_iter()
                .map(|pid| {
                    let ports = if pid_alive(pid) { Some(scan_ports(pid)) } else { None };
                    (pid, ports)
                })
                .collect::<Vec<_>>()
        })
        .await;
        let scanned = match scanned {
            Ok(s) => s,
            Err(e) => {
                warn!("port scan task failed: {e}");
                continue;
            }
        };

        let mut fired = Vec::new();
        {
            let mut state = inner.state.write().await;
            for (pid, ports) in scanned {
                let Some(ports) = ports else {
                    if state.registrations.remove(&pid).is_some() {
                        debug!(pid, "Monitored process exited, dropping registration");
                    }
                    continue;
                };
                let Some(reg) = state.registrations.get_mut(&pid) else {
                    continue;
                };
                for port in ports {
                    if reg.seen.insert(port.port) {
                        fired.push((Arc::clone(&reg.callback), pid, port));
                    }
                }
            }
            if state.registrations.is_empty() {
                state.running = false;
                break;
            }
        }

        if !fired.is_empty() {
            tokio::spawn(deliver(Arc::clone(&inner), fired));
        }
    }
    info!("Port observer stopped");
}

/// Invoke callbacks collected by a scan. A callback whose registration was
/// removed or replaced since the scan is skipped.
async fn deliver(inner: Arc<ObserverInner>, fired: Vec<(PortOpenCallback, u32, PortInfo)>) {
    for (callback, pid, port) in fired {
        if !inner.is_registered(pid, &callback).await {
            debug!(pid, port = port.port, "Monitoring stopped before delivery, dropping port event");
            continue;
        }
        debug!(pid, port = port.port, "Port opened");
        callback(pid, port);
    }
}

#[async_trait]
impl Network for PortObserver {
    async fn ports_for_pid(&self, pid: u32) -> Result<Vec<PortInfo>> {
        if !pid_alive(pid) {
            return Err(SandboxError::NotFound(format!("process with PID {pid} not found")));
        }
        tokio::task::spawn_blocking(move || scan_ports(pid))
            .await
            .map_err(|e| SandboxError::io("port scan", std::io::Error::other(e)))
    }

    async fn register_port_callback(&self, pid: u32, callback: PortOpenCallback) -> Result<()> {
        if !pid_alive(pid) {
            return Err(SandboxError::NotFound(format!("process with PID {pid} not found")));
        }
        let mut state = self.inner.state.write().await;
        state.registrations.insert(
            pid,
            Registration {
                callback,
                seen: HashSet::new(),
            },
        );
        info!(pid, "Port monitoring started");
        if !state.running {
            state.running = true;
            tokio::spawn(observe(Arc::clone(&self.inner)));
        }
        Ok(())
    }

    async fn unregister_port_callback(&self, pid: u32) -> bool {
        let removed = self.inner.state.write().await.registrations.remove(&pid).is_some();
        if removed {
            info!(pid, "Port monitoring stopped");
        }
        removed
    }
}

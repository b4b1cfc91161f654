use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System};

/// How long a node gets to exit after SIGTERM before it is killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(100);

/// A live node process found through the pid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeProcess {
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

impl ResourceUsage {
    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / 1024.0 / 1024.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Terminated,
    Killed,
}

fn refresh(sys: &mut System, pid: Pid) {
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::everything(),
    );
}

pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    refresh(&mut sys, pid);
    sys.process(pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

fn read_pid(pid_path: &Path) -> Result<Option<u32>> {
    match std::fs::read_to_string(pid_path) {
        Ok(data) => {
            let pid = data
                .trim()
                .parse()
                .with_context(|| format!("Malformed pid file {}", pid_path.display()))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", pid_path.display())),
    }
}

/// The managed node, if one is running. A pid file left behind by a dead
/// process is removed.
pub fn running_node(pid_path: &Path) -> Result<Option<NodeProcess>> {
    let Some(pid) = read_pid(pid_path)? else {
        return Ok(None);
    };
    if is_alive(pid) {
        return Ok(Some(NodeProcess { pid }));
    }
    tracing::debug!(pid, "Removing stale pid file");
    let _ = std::fs::remove_file(pid_path);
    Ok(None)
}

/// Spawn `exe args...` detached from this terminal, logging to `log_path`,
/// and record its pid.
pub fn spawn_detached(
    exe: &Path,
    args: &[OsString],
    pid_path: &Path,
    log_path: &Path,
) -> Result<NodeProcess> {
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // own process group so a Ctrl-C in this terminal doesn't reach it
        cmd.process_group(0);
    }

    tracing::debug!(exe = %exe.display(), ?args, "Spawning node");
    let child = cmd.spawn().with_context(|| format!("Failed to spawn {}", exe.display()))?;
    let pid = child.id();
    std::fs::write(pid_path, pid.to_string())
        .with_context(|| format!("Failed to write {}", pid_path.display()))?;
    Ok(NodeProcess { pid })
}

/// CPU and memory of a process. CPU is sampled over sysinfo's minimum
/// update interval, so this blocks briefly.
pub fn resource_usage(pid: u32) -> Option<ResourceUsage> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    refresh(&mut sys, pid);
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    refresh(&mut sys, pid);
    sys.process(pid).map(|p| ResourceUsage {
        cpu_percent: p.cpu_usage(),
        memory_bytes: p.memory(),
    })
}

/// SIGTERM, wait up to `timeout`, then SIGKILL. Removes the pid file.
pub fn stop(node: NodeProcess, pid_path: &Path, timeout: Duration) -> Result<StopOutcome> {
    let pid = Pid::from_u32(node.pid);
    let mut sys = System::new();
    refresh(&mut sys, pid);

    let outcome = match sys.process(pid) {
        None => StopOutcome::Terminated,
        Some(process) => {
            if process.kill_with(Signal::Term) != Some(true) {
                tracing::warn!(pid = node.pid, "SIGTERM not delivered");
            }
            let deadline = Instant::now() + timeout;
            loop {
                if !is_alive(node.pid) {
                    break StopOutcome::Terminated;
                }
                if Instant::now() >= deadline {
                    tracing::warn!(pid = node.pid, "Node ignored SIGTERM, killing");
                    refresh(&mut sys, pid);
                    if let Some(process) = sys.process(pid) {
                        if !process.kill() {
                            tracing::warn!(pid = node.pid, "SIGKILL not delivered");
                        }
                    }
                    break StopOutcome::Killed;
                }
                std::thread::sleep(STOP_POLL);
            }
        }
    };

    match std::fs::remove_file(pid_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", pid_path.display())),
    }
    Ok(outcome)
}

//! Hypervisor process supervision.
//!
//! The Firecracker binary runs in its own session so it survives the
//! invoking terminal. Readiness is only observable by polling: the process
//! must stay alive until its API socket appears on disk.

use crate::error::{Result, VmError};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Everything needed to start one hypervisor process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub vm_id: String,
    pub binary: PathBuf,
    pub socket_path: PathBuf,
    /// Passed to `--log-path`; must exist before launch.
    pub log_path: PathBuf,
    /// Receives the child's stdout and stderr.
    pub screen_log_path: PathBuf,
}

impl LaunchSpec {
    /// Session name recorded for the detached process.
    pub fn session_name(&self) -> String {
        format!("fc_{}", self.vm_id)
    }

    /// Command-line arguments for the hypervisor.
    pub fn args(&self) -> Vec<OsString> {
        vec![
            "--api-sock".into(),
            self.socket_path.clone().into_os_string(),
            "--id".into(),
            self.vm_id.clone().into(),
            "--log-path".into(),
            self.log_path.clone().into_os_string(),
        ]
    }
}

/// A launched hypervisor process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub pid: u32,
    pub session: String,
}

/// Starts and stops hypervisor processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched>;

    /// Stop a process: SIGTERM, then SIGKILL if it outlives the grace period.
    /// A process that is already gone is not an error.
    async fn terminate(&self, pid: u32) -> Result<()>;
}

/// Liveness check for a process id.
pub trait ProcessProbe: Send + Sync {
    fn exists(&self, pid: u32) -> bool;
}

/// Probe backed by `kill(pid, 0)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn exists(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Launches the hypervisor with `setsid` and log redirection.
#[derive(Debug, Clone)]
pub struct SessionLauncher {
    grace: Duration,
}

impl SessionLauncher {
    pub fn new() -> Self {
        Self {
            grace: Duration::from_secs(2),
        }
    }

    /// How long `terminate` waits after SIGTERM before sending SIGKILL.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl Default for SessionLauncher {
    fn default() -> Self {
        Self::new()
    }
}

fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

#[async_trait]
impl ProcessLauncher for SessionLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched> {
        if !spec.binary.is_file() {
            return Err(VmError::Config(format!(
                "hypervisor binary not found at {}",
                spec.binary.display()
            )));
        }

        open_log(&spec.log_path)?;
        let screen = open_log(&spec.screen_log_path)?;
        let screen_err = screen.try_clone()?;

        let mut command = Command::new(&spec.binary);
        command
            .args(spec.args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(screen))
            .stderr(Stdio::from(screen_err))
            .kill_on_drop(false);

        // SAFETY: setsid is async-signal-safe and only touches the child.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let mut child = command.spawn().map_err(|e| {
            VmError::Process(format!(
                "failed to spawn {}: {e}",
                spec.binary.display()
            ))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| VmError::Process("hypervisor exited immediately".into()))?;

        // Reap the child so an early exit is visible to the liveness probe.
        let vm_id = spec.vm_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(vm_id = %vm_id, pid, %status, "Hypervisor exited"),
                Err(e) => tracing::warn!(vm_id = %vm_id, pid, error = %e, "Failed to wait on hypervisor"),
            }
        });

        let session = spec.session_name();
        tracing::info!(vm_id = %spec.vm_id, pid, session = %session, "Hypervisor launched");
        Ok(Launched { pid, session })
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        terminate(&SystemProbe, pid, self.grace).await
    }
}

fn send_signal(pid: u32, sig: Signal) -> Result<bool> {
    let raw = i32::try_from(pid)
        .map_err(|_| VmError::Process(format!("invalid process id {pid}")))?;
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(VmError::Process(format!("failed to send {sig:?} to {pid}: {e}"))),
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate(probe: &dyn ProcessProbe, pid: u32, grace: Duration) -> Result<()> {
    if !probe.exists(pid) {
        tracing::debug!(pid, "Process already gone");
        return Ok(());
    }

    if !send_signal(pid, Signal::SIGTERM)? {
        return Ok(());
    }

    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < grace {
        tokio::time::sleep(step).await;
        waited += step;
        if !probe.exists(pid) {
            tracing::debug!(pid, waited_ms = waited.as_millis() as u64, "Process exited after SIGTERM");
            return Ok(());
        }
    }

    tracing::warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
    send_signal(pid, Signal::SIGKILL)?;
    Ok(())
}

/// Bounds for the control-socket readiness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_millis(500),
        }
    }
}

/// Wait for the API socket of a freshly launched process.
///
/// Each attempt first checks that the process is alive, then whether the
/// socket file exists.
///
/// # Errors
/// - `VmError::Process` if the process dies before the socket appears.
/// - `VmError::Api` once all attempts are exhausted.
pub async fn wait_for_socket(
    probe: &dyn ProcessProbe,
    pid: u32,
    socket_path: &Path,
    policy: ReadinessPolicy,
) -> Result<()> {
    let start = Instant::now();

    for attempt in 1..=policy.attempts {
        if !probe.exists(pid) {
            return Err(VmError::Process(format!(
                "hypervisor process {pid} exited before the control socket appeared"
            )));
        }

        if socket_path.exists() {
            tracing::debug!(
                pid,
                attempt,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Control socket ready"
            );
            return Ok(());
        }

        tracing::trace!(pid, attempt, "Control socket not ready");
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(VmError::Api(format!(
        "control endpoint unreachable: {} did not appear after {} attempts",
        socket_path.display(),
        policy.attempts
    )))
}

//! On-disk registry of microVMs.
//!
//! Every VM owns `<data root>/<id>/`, holding its API socket, rootfs copy,
//! logs and a `vmm.json` record. The registry is the only component that
//! creates or removes those directories.

use crate::error::Result;
use chrono::{DateTime, Utc};
use ember_vm::ProcessProbe;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Record file name inside a VM directory.
pub const RECORD_FILE: &str = "vmm.json";

/// Lifecycle state of a registered VM.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Process launched, configuration in progress
    Configuring,
    Running,
    Paused,
    /// Process is gone
    Stopped,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Configuring => write!(f, "configuring"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Persistent record of one VM.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    pub ip_addr: String,
    pub tap: String,
    /// Bridge the tap is attached to; `None` means NAT.
    pub bridge: Option<String>,
    pub session: Option<String>,
    pub pid: Option<u32>,
    pub state: VmState,
    pub socket_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Filesystem layout of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    pub dir: PathBuf,
    pub socket: PathBuf,
    pub rootfs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub log_file: PathBuf,
    pub screen_log: PathBuf,
    pub record: PathBuf,
}

impl VmPaths {
    pub fn new(root: &Path, id: &str) -> Self {
        let dir = root.join(id);
        let logs_dir = dir.join("logs");
        Self {
            socket: dir.join("firecracker.socket"),
            rootfs_dir: dir.join("rootfs"),
            log_file: logs_dir.join(format!("{id}.log")),
            screen_log: logs_dir.join(format!("{id}_screen.log")),
            record: dir.join(RECORD_FILE),
            logs_dir,
            dir,
        }
    }

    /// Per-VM copy of `source`, named after the source file.
    pub fn rootfs_file(&self, source: &Path) -> PathBuf {
        match source.file_name() {
            Some(name) => self.rootfs_dir.join(name),
            None => self.rootfs_dir.join("rootfs.ext4"),
        }
    }
}

/// Registry rooted at the data path.
#[derive(Clone)]
pub struct VmmRegistry {
    root: PathBuf,
    probe: Arc<dyn ProcessProbe>,
}

impl std::fmt::Debug for VmmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmmRegistry").field("root", &self.root).finish()
    }
}

impl VmmRegistry {
    pub fn new(root: impl Into<PathBuf>, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            root: root.into(),
            probe,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, id: &str) -> VmPaths {
        VmPaths::new(&self.root, id)
    }

    /// True if the VM has a socket or a record on disk.
    pub fn exists(&self, id: &str) -> bool {
        let paths = self.paths(id);
        paths.socket.exists() || paths.record.exists()
    }

    /// Create the VM directory tree.
    pub async fn prepare(&self, id: &str) -> Result<VmPaths> {
        let paths = self.paths(id);
        tokio::fs::create_dir_all(&paths.rootfs_dir).await?;
        tokio::fs::create_dir_all(&paths.logs_dir).await?;
        tracing::debug!(vm_id = %id, dir = %paths.dir.display(), "VM directory prepared");
        Ok(paths)
    }

    /// Copy the base rootfs into the VM directory.
    pub async fn install_rootfs(&self, paths: &VmPaths, source: &Path) -> Result<PathBuf> {
        let target = paths.rootfs_file(source);
        let bytes = tokio::fs::copy(source, &target).await?;
        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            bytes,
            "Root filesystem copied"
        );
        Ok(target)
    }

    /// Persist a record, replacing any previous one.
    pub async fn write(&self, entry: &RegistryEntry) -> Result<()> {
        let paths = self.paths(&entry.id);
        let tmp = paths.dir.join(format!(".{RECORD_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &paths.record).await?;
        Ok(())
    }

    /// Read a record, forcing `Stopped` when its process is gone.
    pub async fn read(&self, id: &str) -> Result<Option<RegistryEntry>> {
        let path = self.paths(id).record;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut entry: RegistryEntry = serde_json::from_slice(&data)?;
        let alive = entry.pid.is_some_and(|pid| self.probe.exists(pid));
        if !alive {
            entry.state = VmState::Stopped;
        }
        Ok(Some(entry))
    }

    /// Update the stored state and return the new record.
    pub async fn set_state(&self, id: &str, state: VmState) -> Result<Option<RegistryEntry>> {
        let Some(mut entry) = self.read(id).await? else {
            return Ok(None);
        };
        entry.state = state;
        self.write(&entry).await?;
        Ok(Some(entry))
    }

    /// All recorded VMs, oldest first.
    pub async fn list(&self) -> Result<Vec<RegistryEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let id = item.file_name().to_string_lossy().into_owned();
            match self.read(&id).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => tracing::warn!(vm_id = %id, error = %e, "Skipping unreadable VM record"),
            }
        }

        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Remove the VM directory tree. Missing directories are ignored.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let dir = self.paths(id).dir;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(vm_id = %id, "VM directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//! Host-wide lock around rule-table read-modify-write sequences.
//!
//! The lock only serializes processes that agree on its path, so the
//! system provisioner always uses [`HOST_LOCK_PATH`](super::HOST_LOCK_PATH).

use crate::error::{Result, VmError};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive `flock` held until dropped.
pub struct ProvisioningLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for ProvisioningLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningLock")
            .field("path", &self.path)
            .finish()
    }
}

impl ProvisioningLock {
    /// Block (off the async runtime) until the lock at `path` is held.
    pub async fn acquire(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(|e| VmError::Network(format!("lock task failed: {e}")))?
    }

    fn acquire_blocking(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            VmError::Network(format!("failed to lock {}: {errno}", path.display()))
        })?;
        tracing::trace!(path = %path.display(), "Provisioning lock acquired");
        Ok(Self { _lock: lock, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_serializes_holders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".network.lock");

        let first = ProvisioningLock::acquire(&path).await.unwrap();
        let waiter = tokio::spawn({
            let path = path.clone();
            async move { ProvisioningLock::acquire(&path).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_ok());
    }
}

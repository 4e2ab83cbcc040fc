// ABOUTME: Single-instance guard backed by a PID file with liveness probing
// ABOUTME: Stale locks from dead processes are cleared automatically

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Holds the PID file for the lifetime of the process. Dropping the
/// guard removes the file.
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Acquire the lock at `path`. Fails if another live process holds
    /// it; a PID file left behind by a dead process is cleared.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Ok(contents) = std::fs::read_to_string(&path) {
            match contents.trim().parse::<u32>() {
                Ok(pid) if pid != std::process::id() && process_alive(pid) => {
                    anyhow::bail!(
                        "Another instance is already running (pid {} in {})",
                        pid,
                        path.display()
                    );
                }
                Ok(pid) => {
                    tracing::warn!(stale_pid = pid, path = %path.display(), "Clearing stale PID lock");
                }
                Err(_) => {
                    tracing::warn!(path = %path.display(), "Clearing malformed PID lock");
                }
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("Failed to write PID file {}", path.display()))?;
        tracing::info!(pid = std::process::id(), path = %path.display(), "PID lock acquired");
        Ok(Self { path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_own_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hub.pid");
        let lock = PidLock::acquire(&path).unwrap();
        let stored: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(stored, std::process::id());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_lock_cleared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hub.pid");
        // u32::MAX is not a valid live pid on any supported platform
        std::fs::write(&path, u32::MAX.to_string()).unwrap();
        let _lock = PidLock::acquire(&path).unwrap();
        let stored: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(stored, std::process::id());
    }

    #[test]
    fn test_live_lock_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hub.pid");
        // pid 1 is always alive
        std::fs::write(&path, "1").unwrap();
        assert!(PidLock::acquire(&path).is_err());
    }

    #[test]
    fn test_malformed_lock_cleared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hub.pid");
        std::fs::write(&path, "not a pid").unwrap();
        assert!(PidLock::acquire(&path).is_ok());
    }
}

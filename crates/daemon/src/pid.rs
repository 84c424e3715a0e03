//! Per-instance PID files
//!
//! A PID file whose process is gone is stale: readers treat the instance
//! as stopped and remove the file.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub const PID_FILE: &str = "node.pid";

#[derive(Error, Debug)]
pub enum PidError {
    #[error("Already running as pid {0}")]
    AlreadyRunning(u32),

    #[error("Failed to write PID file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub fn pid_path(dir: &Path) -> PathBuf {
    dir.join(PID_FILE)
}

fn read_pid(dir: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path(dir))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // exists but owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

/// PID of the live process owning `dir`, cleaning up a stale file
pub fn running_pid(dir: &Path) -> Option<u32> {
    let pid = read_pid(dir)?;
    if is_process_alive(pid) {
        return Some(pid);
    }
    debug!("Removing stale PID file for {} in {:?}", pid, dir);
    let _ = std::fs::remove_file(pid_path(dir));
    None
}

/// Ask a running instance to shut down
#[cfg(unix)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "stop is only supported on unix",
    ))
}

/// Holds the PID file for this process; removes it on drop
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    /// Claim `dir` for this process. Fails with the owner's PID if another
    /// live process holds it, or if the PID file cannot be written (the
    /// instance would otherwise look stopped while it runs).
    pub fn acquire(dir: &Path) -> Result<Self, PidError> {
        if let Some(pid) = running_pid(dir) {
            if pid != std::process::id() {
                return Err(PidError::AlreadyRunning(pid));
            }
        }
        let path = pid_path(dir);
        std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::write(&path, std::process::id().to_string()))
            .map_err(|source| PidError::Write {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mumblechat-pid-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_guard_writes_and_removes() {
        let dir = temp_dir("guard");
        {
            let guard = PidGuard::acquire(&dir).unwrap();
            assert!(guard.path().exists());
            assert_eq!(running_pid(&dir), Some(std::process::id()));
        }
        assert!(!pid_path(&dir).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unwritable_pid_file_is_an_error() {
        let dir = temp_dir("unwritable");
        // a regular file where the instance directory should be
        let blocker = dir.join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let err = PidGuard::acquire(&blocker).unwrap_err();
        assert!(matches!(err, PidError::Write { .. }));
        assert_eq!(running_pid(&blocker), None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn test_live_owner_blocks_acquire() {
        let dir = temp_dir("owned");
        // pid 1 is always alive
        std::fs::write(pid_path(&dir), "1").unwrap();
        assert!(matches!(PidGuard::acquire(&dir), Err(PidError::AlreadyRunning(1))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_pid_is_cleaned() {
        let dir = temp_dir("stale");
        // beyond the default pid_max
        std::fs::write(pid_path(&dir), "4194304").unwrap();
        assert_eq!(running_pid(&dir), None);
        assert!(!pid_path(&dir).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_garbage_pid_file() {
        let dir = temp_dir("garbage");
        std::fs::write(pid_path(&dir), "not a pid").unwrap();
        assert_eq!(running_pid(&dir), None);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! PID file handling.
//!
//! A stale PID file (no such process in `/proc`) is overwritten; a live
//! collision is reported so startup can bail out.

use sqlmon_common::error::{AgentError, Result};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claims `path` for this process. Fails when another live process
    /// already holds it.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(pid) = read_pid(&path) {
            if process_alive(pid) {
                return Err(AgentError::Fatal(format!(
                    "PID file {} held by running process {pid}",
                    path.display()
                )));
            }
            tracing::warn!(path = %path.display(), pid, "Removing stale PID file");
        }
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "PID file not removed");
            }
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_and_removes_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.pid");
        {
            let pidfile = PidFile::create(&path).unwrap();
            assert_eq!(pidfile.path(), path);
            let pid: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
            assert_eq!(pid, std::process::id());
        }
        assert!(!path.exists());
    }

    #[test]
    fn live_collision_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.pid");
        // Our own PID is live by definition.
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        let err = PidFile::create(&path).unwrap_err();
        assert!(matches!(err, AgentError::Fatal(_)));
        assert!(path.exists());
    }

    #[test]
    fn stale_file_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.pid");
        // PID 0 never names a real process entry under /proc.
        std::fs::write(&path, "0\n").unwrap();
        let pidfile = PidFile::create(&path).unwrap();
        drop(pidfile);
        assert!(!path.exists());
    }
}

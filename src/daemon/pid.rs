//! Single-instance guard.
//!
//! The PID file is written on start and removed when the guard drops. A
//! file left behind by a crashed process is taken over when the recorded
//! process is no longer alive.

use std::path::{Path, PathBuf};

use sysinfo::{Pid, ProcessesToUpdate, System};

use super::DaemonError;
use crate::utils::write_atomic;

/// Holds the PID file for the lifetime of the daemon.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Claim `path` for the current process.
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        let pid = std::process::id();

        if let Some(existing) = read_pid(path)
            && existing != pid
        {
            if is_process_alive(existing) {
                return Err(DaemonError::AlreadyRunning {
                    pid: existing,
                    pid_file: path.to_path_buf(),
                });
            }
            tracing::warn!(
                "[daemon] removing stale pid file {} (pid {existing})",
                path.display()
            );
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DaemonError::PidFile {
                path: path.to_path_buf(),
                source,
            })?;
        }
        write_atomic(path, format!("{pid}\n").as_bytes()).map_err(|source| {
            DaemonError::PidFile {
                path: path.to_path_buf(),
                source,
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Another instance may have taken over a file we thought was ours
        if read_pid(&self.path) == Some(self.pid)
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            tracing::warn!("[daemon] failed to remove {}: {e}", self.path.display());
        }
    }
}

/// The PID recorded in `path`, if the file exists and parses.
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

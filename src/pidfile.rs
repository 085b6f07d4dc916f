//! PID files for supervised replicas.
//!
//! Each running replica has `<pid_dir>/<name-index>.pid` holding its process
//! id as text. The files exist for external tools and for watch-triggered
//! restarts, which kill a replica through its recorded pid. They are never
//! used to recover state after the supervisor itself restarts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::process::ReplicaId;

pub fn pid_file_path(pid_dir: &Path, id: &ReplicaId) -> PathBuf {
    pid_dir.join(format!("{}.pid", id))
}

/// Records `pid` for `id`, creating the PID directory when needed.
pub async fn write_pid_file(pid_dir: &Path, id: &ReplicaId, pid: u32) -> Result<()> {
    tokio::fs::create_dir_all(pid_dir)
        .await
        .with_context(|| format!("Error creating the pids directory {}", pid_dir.display()))?;
    let path = pid_file_path(pid_dir, id);
    tokio::fs::write(&path, pid.to_string())
        .await
        .with_context(|| format!("Error writing pid file {}", path.display()))?;
    Ok(())
}

pub async fn read_pid_file(pid_dir: &Path, id: &ReplicaId) -> Result<u32> {
    let path = pid_file_path(pid_dir, id);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Error reading pid file {}", path.display()))?;
    raw.trim()
        .parse()
        .with_context(|| format!("invalid pid {:?} in {}", raw, path.display()))
}

/// Removes the PID file of `id` if it exists.
pub async fn remove_pid_file(pid_dir: &Path, id: &ReplicaId) -> Result<()> {
    let path = pid_file_path(pid_dir, id);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Error removing pid file {}", path.display())),
    }
}

/// Terminates the process recorded in the PID file of `id`.
///
/// Failing to read the PID file is an error. A process that no longer exists
/// is only logged. Returns the pid that was signalled.
pub async fn kill_from_pid_file(pid_dir: &Path, id: &ReplicaId) -> Result<u32> {
    let pid = read_pid_file(pid_dir, id).await?;
    if let Err(err) = terminate(pid) {
        tracing::warn!("[forewoman] could not stop {} (pid {}): {}", id, pid, err);
    }
    Ok(pid)
}

#[cfg(unix)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("taskkill exited with {}", status),
        ))
    }
}

//! Run Lock
//!
//! Keeps two updater runs from sharing one scratch directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Lock file name inside the scratch directory
pub const LOCK_FILE: &str = "update.lock";

/// Information stored in a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub system_image: String,
}

impl LockInfo {
    pub fn new(system_image: &Path) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            system_image: system_image.display().to_string(),
        }
    }

    /// Check if the process that created the lock is still running
    pub fn is_process_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }
        // 0 and negative values address process groups, not a single process
        let pid = match libc::pid_t::try_from(self.pid) {
            Ok(pid) if pid > 0 => pid,
            _ => return false,
        };
        // SAFETY: signal 0 performs the permission and existence checks only
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

pub struct RunLock;

impl RunLock {
    pub fn lock_path(scratch_dir: &Path) -> PathBuf {
        scratch_dir.join(LOCK_FILE)
    }

    /// Acquire the lock for `scratch_dir`, reclaiming it from a dead process
    pub fn acquire(scratch_dir: &Path, system_image: &Path) -> Result<LockGuard, LockError> {
        fs::create_dir_all(scratch_dir).map_err(|e| LockError::Io(e.to_string()))?;
        let lock_path = Self::lock_path(scratch_dir);

        if let Some(existing) = Self::read(scratch_dir) {
            if existing.is_process_alive() {
                return Err(LockError::AlreadyLocked {
                    pid: existing.pid,
                    started_at: existing.started_at,
                });
            }
            warn!(pid = existing.pid, "reclaiming stale update lock");
            let _ = fs::remove_file(&lock_path);
        }

        let info = LockInfo::new(system_image);
        let content = serde_json::to_string_pretty(&info).map_err(|e| LockError::Serialize(e.to_string()))?;

        // create_new so a concurrent acquirer loses instead of overwriting
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = Self::read(scratch_dir);
                return Err(LockError::AlreadyLocked {
                    pid: holder.as_ref().map_or(0, |h| h.pid),
                    started_at: holder.map_or_else(Utc::now, |h| h.started_at),
                });
            }
            Err(e) => return Err(LockError::Io(e.to_string())),
        };
        file.write_all(content.as_bytes())
            .map_err(|e| LockError::Io(e.to_string()))?;

        debug!(path = %lock_path.display(), "update lock acquired");
        Ok(LockGuard { lock_path })
    }

    /// Read the current lock holder, if any
    pub fn read(scratch_dir: &Path) -> Option<LockInfo> {
        fs::read_to_string(Self::lock_path(scratch_dir))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    }
}

/// RAII guard that releases lock on drop
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Lock errors
#[derive(Error, Debug, Clone)]
pub enum LockError {
    #[error("Another update run (PID {pid}, started {started_at}) holds the lock")]
    AlreadyLocked { pid: u32, started_at: DateTime<Utc> },
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
}

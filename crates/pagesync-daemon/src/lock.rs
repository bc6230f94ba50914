//! Advisory session lock for a synced tree.
//!
//! A single lock file signals "a sync session is active"; its absence is
//! the only precondition other tooling may rely on before touching the
//! tree. The file carries the owner PID and start timestamp. There is no
//! staleness heuristic: a lock left behind by a crash must be removed by
//! the operator.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use pagesync_core::store::STATE_DIR;

const LOCK_FILE: &str = "lock";

/// Contents of the lock file.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Held advisory lock. Removing the file on drop covers every graceful
/// exit path; the OS lock additionally fences concurrent sessions racing
/// on the same file.
pub struct SessionLock {
    path: PathBuf,
    // Held for the OS-level advisory lock; released on drop
    _file: File,
}

impl SessionLock {
    /// Acquire the session lock for `tree_root`.
    ///
    /// Fails if another session already holds it.
    pub fn acquire(tree_root: &Path) -> Result<Self> {
        let dir = tree_root.join(STATE_DIR);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(LOCK_FILE);

        if path.exists() {
            let holder = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| serde_json::from_str::<LockInfo>(&s).ok());
            match holder {
                Some(info) => bail!(
                    "sync session already active for {} (pid {}, started {})",
                    tree_root.display(),
                    info.pid,
                    info.started_at
                ),
                None => bail!(
                    "lock file {} exists but is unreadable; remove it if no session is running",
                    path.display()
                ),
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("creating lock file {}", path.display()))?;
        file.try_lock_exclusive()
            .with_context(|| format!("locking {}", path.display()))?;

        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
        file.flush()?;

        debug!("Acquired session lock at {}", path.display());
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove session lock {}: {}", self.path.display(), e);
        } else {
            debug!("Released session lock at {}", self.path.display());
        }
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{PipelineError, StoreError};

/// Contents of `state/run.lock`, kept for diagnostics after release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMarker {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub command: String,
}

/// Exclusive per-project run lock, held for one invocation.
///
/// The advisory lock is released by the OS if the process dies, so a crashed
/// invocation never wedges the project.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path, command: &str) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = serde_json::from_str::<LockMarker>(&holder)
                .map(|m| format!("pid {} running '{}' since {}", m.pid, m.command, m.acquired_at))
                .unwrap_or_else(|_| "unknown holder".to_string());
            return Err(PipelineError::RunLocked {
                path: path.to_path_buf(),
                holder,
            });
        }

        let marker = LockMarker {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            command: command.to_string(),
        };
        let json = serde_json::to_string_pretty(&marker).map_err(StoreError::Encode)?;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(json.as_bytes()))
            .and_then(|_| file.sync_data())
            .map_err(|e| StoreError::io(path, e))?;

        debug!(path = %path.display(), command, "Acquired run lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Whether another invocation currently holds the lock at `path`.
    pub fn is_held(path: &Path) -> bool {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => {
                if file.try_lock_exclusive().is_ok() {
                    let _ = fs2::FileExt::unlock(&file);
                    false
                } else {
                    true
                }
            }
            Err(_) => false,
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "Released run lock");
    }
}

//! Per-invocation scratch directory for office conversion.
//!
//! The converter needs real files on disk. Each rasterisation gets its own
//! directory so concurrent runs never share paths. [`ScratchDir::release`]
//! removes every entry with bounded retries, because on some platforms the
//! converter process still holds its output for a moment after exiting.
//! If a caller forgets to release, `TempDir`'s own drop is the fallback.

use crate::error::IntakeError;
use crate::retry::{is_lock_error, retry_async, Backoff};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn new() -> Result<Self, IntakeError> {
        let dir = tempfile::Builder::new()
            .prefix("loan-intake-")
            .tempdir()
            .map_err(|e| IntakeError::Internal(format!("scratch dir: {e}")))?;
        debug!("Created scratch dir {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove every file, retrying while the OS reports it locked, then
    /// remove the directory itself. Never fails: leftovers are logged.
    pub async fn release(self, backoff: Backoff) {
        let root = self.dir.path().to_path_buf();
        let entries: Vec<PathBuf> = match std::fs::read_dir(&root) {
            Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(e) => {
                warn!("Cannot list scratch dir {}: {}", root.display(), e);
                Vec::new()
            }
        };

        for path in entries {
            let label = format!("remove {}", path.display());
            let removed = retry_async(
                backoff,
                &label,
                || remove_entry(path.clone()),
                is_lock_error,
            )
            .await;
            if let Err(e) = removed {
                warn!("Failed to remove temp file {}: {}", path.display(), e);
            }
        }

        match self.dir.close() {
            Ok(()) => debug!("Removed scratch dir {}", root.display()),
            Err(e) => warn!("Failed to remove scratch dir {}: {}", root.display(), e),
        }
    }
}

async fn remove_entry(path: PathBuf) -> std::io::Result<()> {
    let result = if path.is_dir() {
        tokio::fs::remove_dir_all(&path).await
    } else {
        tokio::fs::remove_file(&path).await
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

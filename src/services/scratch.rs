//! Intermediate files and the directory that holds them.
//!
//! A [`ScratchFile`] removes its path when dropped, so every exit path of a
//! pipeline (success, stage failure, cancellation) releases what it created.
//! Removal failures are logged and never escalated.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::Utc;
use tracing::{debug, warn};

use crate::errors::{PipelineError, PipelineResult};

/// Default scratch location when none is configured.
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp/ceph-pvc-backup";

/// Timestamp embedded in scratch file names, e.g. `20261019-142501-123`.
pub fn scratch_stamp() -> String {
    Utc::now().format("%Y%m%d-%H%M%S-%3f").to_string()
}

/// Create the scratch directory if it does not exist yet.
pub async fn ensure_dir(dir: &Path) -> PipelineResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| PipelineError::io("create scratch directory", dir, err))
}

/// Remove `path`, logging instead of failing. Returns whether a file was removed.
pub fn remove_logged(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed scratch file {}", path.display());
            true
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("scratch file {} was already removed", path.display());
            false
        }
        Err(err) => {
            warn!("failed to remove scratch file {}: {}", path.display(), err);
            false
        }
    }
}

/// An intermediate file owned by one pipeline invocation.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    armed: bool,
}

impl ScratchFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file now rather than at drop.
    pub fn release(mut self) -> bool {
        self.armed = false;
        remove_logged(&self.path)
    }

    /// Keep the file on disk and hand back its path.
    pub fn persist(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.armed {
            remove_logged(&self.path);
        }
    }
}

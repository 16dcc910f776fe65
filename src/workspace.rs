//! Ephemeral per-invocation workspace.
//!
//! A workspace is a uniquely named temporary directory holding exactly one
//! file: the source payload, under the name its language profile expects.
//! It is bind-mounted into the container and removed when the invocation
//! ends. `release()` is idempotent, and dropping an unreleased workspace
//! still removes the directory.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::WorkspaceError;
use crate::languages::LanguageProfile;

/// Prefix of every workspace directory name.
const WORKSPACE_PREFIX: &str = "golfbox-";

#[derive(Debug)]
pub struct Workspace {
    /// `None` once released.
    dir: Option<TempDir>,
    path: PathBuf,
    source_path: PathBuf,
}

impl Workspace {
    /// Creates a fresh directory under `base` (system temp dir when `None`)
    /// and writes `source` to `<dir>/<profile.file_name>`.
    pub fn acquire(
        base: Option<&Path>,
        profile: &LanguageProfile,
        source: &[u8],
    ) -> Result<Self, WorkspaceError> {
        profile.validate_file_name()?;

        let base = match base {
            Some(base) => base.to_path_buf(),
            None => std::env::temp_dir(),
        };
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&base)
            .map_err(|e| WorkspaceError::io("create workspace in", &base, e))?;

        // Docker requires absolute bind sources
        let path = std::path::absolute(dir.path())
            .map_err(|e| WorkspaceError::io("resolve", dir.path(), e))?;
        let source_path = path.join(&profile.file_name);

        // On failure `dir` is dropped here, which removes it
        std::fs::write(&source_path, source)
            .map_err(|e| WorkspaceError::io("write", &source_path, e))?;

        debug!(
            "Workspace {} acquired ({} bytes of source)",
            path.display(),
            source.len()
        );

        Ok(Self {
            dir: Some(dir),
            path,
            source_path,
        })
    }

    /// Host path of the workspace directory (the bind source).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host path of the source file.
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn is_released(&self) -> bool {
        self.dir.is_none()
    }

    /// Removes the directory and everything in it. Calling it again is a
    /// no-op.
    pub fn release(&mut self) -> Result<(), WorkspaceError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        match dir.close() {
            Ok(()) => {
                debug!("Workspace {} released", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Workspace {} was already gone", self.path.display());
                Ok(())
            }
            Err(e) => Err(WorkspaceError::io("remove", &self.path, e)),
        }
    }
}

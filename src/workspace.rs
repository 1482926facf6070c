//! Per-run working directories and filesystem staging.
//!
//! Every program run gets a fresh directory under the executor's root,
//! named by a 128-bit identifier so that concurrent runs cannot collide.
//! Executors declare the files they need on disk as a [`FilesystemMapping`];
//! staging materializes the mapping under the workspace and nowhere else.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use crate::errors::RunnerError;

/// A file to materialize under a workspace before launch.
#[derive(Debug, Clone)]
pub struct MappedFile {
    /// Path relative to the workspace root; missing parents are created.
    pub path: PathBuf,
    pub content: Vec<u8>,
    /// Set the user-execute bit on the staged file.
    pub executable: bool,
}

impl MappedFile {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            executable: false,
        }
    }

    pub fn executable(path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            executable: true,
        }
    }
}

/// Ordered set of files an executor wants on disk prior to launch.
pub type FilesystemMapping = Vec<MappedFile>;

/// Generate a fresh 128-bit workspace identifier (32 hex chars).
pub fn new_workspace_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// A per-run directory under an executor's root.
///
/// Created eagerly; removal is explicit so that a failed run leaves the
/// directory behind for post-mortem inspection.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Create `root/id`. Fails if the directory already exists.
    pub fn create(root: &Path, id: &str) -> Result<Self, RunnerError> {
        let path = root.join(id);
        fs::create_dir(&path).map_err(|err| {
            RunnerError::Workspace(format!("failed to create {}: {err}", path.display()))
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the directory and everything under it.
    pub fn remove(self) -> Result<(), RunnerError> {
        fs::remove_dir_all(&self.path).map_err(|err| {
            RunnerError::Workspace(format!("failed to remove {}: {err}", self.path.display()))
        })
    }
}

/// Resolve a mapping path against the workspace, rejecting escapes.
fn resolve_staged_path(workspace: &Path, relative: &Path) -> Result<PathBuf, RunnerError> {
    if relative.as_os_str().is_empty() || relative.is_absolute() {
        return Err(RunnerError::Staging(format!(
            "invalid mapping path: {}",
            relative.display()
        )));
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(RunnerError::Staging(format!(
                    "mapping path escapes the workspace: {}",
                    relative.display()
                )))
            }
        }
    }
    Ok(workspace.join(relative))
}

/// Write every mapped file under the workspace, creating parents.
///
/// Writes are sequential: each file is fully written (and its mode set)
/// before the next one starts. Content bytes are written as-is.
pub fn stage_files(workspace: &Workspace, mapping: &FilesystemMapping) -> Result<(), RunnerError> {
    let mut seen = BTreeSet::new();
    for file in mapping {
        if !seen.insert(file.path.as_path()) {
            return Err(RunnerError::Staging(format!(
                "duplicate path in mapping: {}",
                file.path.display()
            )));
        }
        let path = resolve_staged_path(workspace.path(), &file.path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &file.content)?;
        let mode = if file.executable { 0o755 } else { 0o644 };
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

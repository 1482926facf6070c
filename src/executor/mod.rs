//! Execution backends.
//!
//! An [`Executor`] turns a validated program plus its compute context into a
//! launched child process and a normalized [`ExecutorResult`]. Backends only
//! declare *what* must be on disk ([`Executor::filesystem_mapping`]) and
//! *how* to launch it ([`Executor::command`]); the run pipeline owns the
//! workspace lifecycle, the actual spawn and the outcome classification.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::errors::RunnerError;
use crate::models::{ComputeContext, ExecutorResult, Program};
use crate::slurm;
use crate::workspace::FilesystemMapping;

mod podman;
mod sandbox;
mod unsafe_exec;

pub use podman::PodmanExecutor;
pub use sandbox::SandboxExecutor;
pub use unsafe_exec::UnsafeExecutor;

/// Names of the per-phase timing files written by the generated run script.
#[derive(Debug, Clone)]
pub struct PerfFiles {
    pub create_venv: String,
    pub install_deps: String,
    pub program: String,
}

impl Default for PerfFiles {
    fn default() -> Self {
        Self {
            create_venv: ".create_venv_time_ns".to_string(),
            install_deps: ".install_deps_time_ns".to_string(),
            program: ".program_time_ns".to_string(),
        }
    }
}

impl PerfFiles {
    pub fn names(&self) -> [&str; 3] {
        [&self.create_venv, &self.install_deps, &self.program]
    }
}

/// How to launch a staged program: argv plus environment overrides.
///
/// `argv[0]` is either an absolute binary or a path inside the workspace.
/// The overrides are merged over the worker's own environment and win on
/// conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorCommand {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ExecutorCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            env: BTreeMap::new(),
        }
    }
}

/// Available executor variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Podman,
    Unsafe,
    Sandbox,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Podman => "podman",
            ExecutorKind::Unsafe => "unsafe",
            ExecutorKind::Sandbox => "sandbox",
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "podman" => Ok(ExecutorKind::Podman),
            "unsafe" => Ok(ExecutorKind::Unsafe),
            "sandbox" => Ok(ExecutorKind::Sandbox),
            other => Err(format!(
                "unknown executor type: {other} (expected podman, unsafe or sandbox)"
            )),
        }
    }
}

/// Build an executor rooted at `root_dir`.
///
/// Async because sandbox construction may download the sandbox binary.
pub async fn create_executor(
    kind: ExecutorKind,
    root_dir: PathBuf,
) -> Result<Box<dyn Executor>, RunnerError> {
    Ok(match kind {
        ExecutorKind::Podman => Box::new(PodmanExecutor::new(root_dir)),
        ExecutorKind::Unsafe => Box::new(UnsafeExecutor::new(root_dir)),
        ExecutorKind::Sandbox => Box::new(SandboxExecutor::new(root_dir).await?),
    })
}

/// An isolation backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Directory under which per-run workspaces are allocated.
    fn root_dir(&self) -> &Path;

    /// Files that must be on disk prior to launch.
    ///
    /// Pure: nothing is written here. `perf` carries the timing-file names
    /// when the caller wants per-phase timings recorded.
    fn filesystem_mapping(
        &self,
        program: &Program,
        context: &ComputeContext,
        perf: Option<&PerfFiles>,
    ) -> Result<FilesystemMapping, RunnerError>;

    /// How to launch once `workspace` has been staged. Pure.
    fn command(
        &self,
        workspace: &Path,
        program: &Program,
        context: &ComputeContext,
    ) -> Result<ExecutorCommand, RunnerError>;

    /// Precondition check consulted before a workspace is allocated.
    ///
    /// The default accepts everything except a Slurm context whose root
    /// working directory is not NFS-backed: the allocated node reaches the
    /// staged files over the shared filesystem, so anything else cannot
    /// work.
    fn is_compatible(&self, context: &ComputeContext) -> (bool, String) {
        if context.slurm && !slurm::is_nfs_backed(self.root_dir()) {
            return (
                false,
                format!(
                    "slurm jobs require an NFS-backed root working directory, {} is not",
                    self.root_dir().display()
                ),
            );
        }
        (true, String::new())
    }

    /// Serializes spawns for backends that cannot tolerate concurrent
    /// launches. The pipeline holds the lock across spawn and collection.
    fn spawn_lock(&self) -> Option<&Mutex<()>> {
        None
    }

    /// Drain the child's stdout/stderr fully and yield a normalized exit
    /// code (missing code, e.g. death by signal, maps to 1).
    async fn collect(&self, _workspace: &Path, child: Child) -> Result<ExecutorResult, RunnerError> {
        let output = child.wait_with_output().await.map_err(|err| {
            RunnerError::Execution(format!("failed to collect process output: {err}"))
        })?;
        Ok(ExecutorResult {
            exit_code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_kind_round_trip() {
        for kind in [ExecutorKind::Podman, ExecutorKind::Unsafe, ExecutorKind::Sandbox] {
            assert_eq!(ExecutorKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(ExecutorKind::from_str("docker").is_err());
    }
}

//! Sandboxed execution backend.
//!
//! Wraps the host-local backend with conty, a user-space sandboxing binary.
//! The filesystem is bound read-only except for the workspace subtree and
//! the uv cache; `/proc` and `/dev` are provided inside the sandbox. conty
//! swallows the wrapped process's exit code, so collection reads the
//! `exit_code` file the run script leaves in the workspace.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::constants::{CONTY_DOWNLOAD_URL, CONTY_PATH};
use crate::errors::RunnerError;
use crate::executor::{Executor, ExecutorCommand, PerfFiles, UnsafeExecutor};
use crate::helpers::download_file;
use crate::models::{ComputeContext, ExecutorResult, Program};
use crate::workspace::FilesystemMapping;

/// Runs the unsafe backend's bootstrap script inside a conty sandbox.
pub struct SandboxExecutor {
    inner: UnsafeExecutor,
    conty_path: PathBuf,
    // Concurrent conty mounts fail intermittently on shared hosts.
    spawn_lock: Mutex<()>,
}

impl SandboxExecutor {
    /// Build the executor, downloading the conty binary if it is missing.
    ///
    /// Failure to obtain the binary is a fatal construction error.
    pub async fn new(root_dir: PathBuf) -> Result<Self, RunnerError> {
        let conty_path = PathBuf::from(CONTY_PATH.as_str());
        if !conty_path.exists() {
            download_file(&CONTY_DOWNLOAD_URL, &conty_path).await?;
            // A fresh download carries no execute bit; an existing binary's
            // mode is ops-managed and left alone.
            let mut permissions = fs::metadata(&conty_path)?.permissions();
            permissions.set_mode(permissions.mode() | 0o100);
            fs::set_permissions(&conty_path, permissions)?;
        }

        Ok(Self {
            inner: UnsafeExecutor::new(root_dir),
            conty_path,
            spawn_lock: Mutex::new(()),
        })
    }

    /// uv binary, uv application state and uv cache, resolved under the
    /// worker's home directory. The sandbox binds the first two read-only
    /// and the cache writable (uv may download interpreters and wheels).
    fn uv_paths() -> Result<(String, String, String), RunnerError> {
        let home = dirs::home_dir()
            .ok_or_else(|| RunnerError::Execution("could not resolve home directory".to_string()))?;
        Ok((
            home.join(".cargo/bin/uv").display().to_string(),
            home.join(".local/share/uv").display().to_string(),
            home.join(".cache/uv").display().to_string(),
        ))
    }
}

#[async_trait]
impl Executor for SandboxExecutor {
    fn root_dir(&self) -> &Path {
        self.inner.root_dir()
    }

    fn filesystem_mapping(
        &self,
        program: &Program,
        context: &ComputeContext,
        perf: Option<&PerfFiles>,
    ) -> Result<FilesystemMapping, RunnerError> {
        self.inner.filesystem_mapping(program, context, perf)
    }

    fn command(
        &self,
        workspace: &Path,
        _program: &Program,
        _context: &ComputeContext,
    ) -> Result<ExecutorCommand, RunnerError> {
        let (uv_bin, uv_state, uv_cache) = Self::uv_paths()?;
        let workspace_parent = workspace
            .parent()
            .unwrap_or(workspace)
            .display()
            .to_string();

        let mut argv = vec![self.conty_path.display().to_string()];
        for (option, path) in [
            ("--ro-bind", "/".to_string()),
            ("--ro-bind", uv_bin),
            ("--ro-bind", uv_state),
            ("--bind", uv_cache),
            ("--bind", workspace_parent),
        ] {
            argv.push(option.to_string());
            argv.push(path.clone());
            argv.push(path);
        }
        argv.push("--proc".to_string());
        argv.push("/proc".to_string());
        argv.push("--dev-bind".to_string());
        argv.push("/dev".to_string());
        argv.push("/dev".to_string());
        argv.push(workspace.join("run.sh").display().to_string());

        let env: BTreeMap<String, String> = [
            ("SANDBOX", "1"),
            ("SANDBOX_LEVEL", "1"),
            ("QUIET_MODE", "1"),
            ("VIRTUAL_ENV", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Ok(ExecutorCommand { argv, env })
    }

    fn spawn_lock(&self) -> Option<&Mutex<()>> {
        Some(&self.spawn_lock)
    }

    /// conty exits with its own status regardless of the wrapped process,
    /// so the run script's `exit_code` file is authoritative here.
    async fn collect(&self, workspace: &Path, child: Child) -> Result<ExecutorResult, RunnerError> {
        let output = child.wait_with_output().await.map_err(|err| {
            RunnerError::Execution(format!("failed to collect process output: {err}"))
        })?;
        let exit_code = fs::read_to_string(workspace.join("exit_code"))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(1);
        Ok(ExecutorResult {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{File, Language};

    fn executor() -> SandboxExecutor {
        SandboxExecutor {
            inner: UnsafeExecutor::new(PathBuf::from("/srv/wd")),
            conty_path: PathBuf::from("/opt/conty.sh"),
            spawn_lock: Mutex::new(()),
        }
    }

    fn program() -> Program {
        Program {
            entrypoint: "main.py".to_string(),
            files: vec![File {
                name: "main.py".to_string(),
                content: "print(1)".to_string(),
                is_binary: false,
            }],
            tracking: Default::default(),
        }
    }

    fn context() -> ComputeContext {
        ComputeContext {
            language: Language::Python,
            time_limit_secs: 5.0,
            memory_limit_mb: 128,
            slurm: false,
            slurm_options: vec![],
            slurm_use_system_py: false,
            extra_options: BTreeMap::new(),
        }
    }

    #[test]
    fn test_command_binds_and_env() {
        let command = executor()
            .command(Path::new("/srv/wd/abc"), &program(), &context())
            .unwrap();

        assert_eq!(command.argv[0], "/opt/conty.sh");
        assert_eq!(command.argv.last().unwrap(), "/srv/wd/abc/run.sh");

        // Root of the filesystem is read-only; the workspace parent is
        // writable so the run script can create the venv and exit_code.
        let joined = command.argv.join(" ");
        assert!(joined.contains("--ro-bind / /"));
        assert!(joined.contains("--bind /srv/wd /srv/wd"));
        assert!(joined.contains("--proc /proc"));
        assert!(joined.contains("--dev-bind /dev /dev"));

        assert_eq!(command.env.get("SANDBOX"), Some(&"1".to_string()));
        assert_eq!(command.env.get("SANDBOX_LEVEL"), Some(&"1".to_string()));
        assert_eq!(command.env.get("QUIET_MODE"), Some(&"1".to_string()));
        assert_eq!(command.env.get("VIRTUAL_ENV"), Some(&String::new()));
    }

    #[test]
    fn test_spawn_lock_is_exposed() {
        assert!(executor().spawn_lock().is_some());
    }

    #[test]
    fn test_mapping_matches_unsafe_backend() {
        let sandbox = executor();
        let unsafe_exec = UnsafeExecutor::new(PathBuf::from("/srv/wd"));
        let sandbox_paths: Vec<_> = sandbox
            .filesystem_mapping(&program(), &context(), None)
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        let unsafe_paths: Vec<_> = unsafe_exec
            .filesystem_mapping(&program(), &context(), None)
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(sandbox_paths, unsafe_paths);
    }
}

//! Container-based execution backend.

use std::path::{Path, PathBuf};

use crate::constants::DEFAULT_EXEC_PY_VERSION;
use crate::errors::RunnerError;
use crate::executor::{Executor, ExecutorCommand, PerfFiles};
use crate::models::{ComputeContext, Program};
use crate::workspace::{FilesystemMapping, MappedFile};

/// Runs programs inside a podman container.
///
/// The workspace is mounted at `/run` inside the container. The container
/// memory cap handles OOM (SIGKILL, 137); `timeout` inside the container
/// handles wall time (124).
pub struct PodmanExecutor {
    root_dir: PathBuf,
}

impl PodmanExecutor {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }
}

impl Executor for PodmanExecutor {
    fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn filesystem_mapping(
        &self,
        program: &Program,
        _context: &ComputeContext,
        _perf: Option<&PerfFiles>,
    ) -> Result<FilesystemMapping, RunnerError> {
        program
            .files
            .iter()
            .map(|file| Ok(MappedFile::new(&file.name, file.decoded_data()?)))
            .collect()
    }

    fn command(
        &self,
        workspace: &Path,
        program: &Program,
        context: &ComputeContext,
    ) -> Result<ExecutorCommand, RunnerError> {
        // The mount source must be absolute; the workspace may not exist yet
        // when the command is synthesized for a Slurm execution directory.
        let workspace_abs = std::path::absolute(workspace)?;
        let image = format!("python:{}", DEFAULT_EXEC_PY_VERSION.as_str());

        Ok(ExecutorCommand::new(vec![
            "podman".to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "-m".to_string(),
            format!("{}m", context.memory_limit_mb),
            "-v".to_string(),
            format!("{}:/run", workspace_abs.display()),
            image,
            "timeout".to_string(),
            "--verbose".to_string(),
            format!("{}s", context.time_limit_secs),
            "python".to_string(),
            format!("/run/{}", program.entrypoint),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{File, Language};
    use std::collections::BTreeMap;

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
    fn test_mapping_stages_files_at_declared_names() {
        let executor = PodmanExecutor::new(PathBuf::from("/srv/wd"));
        let mapping = executor
            .filesystem_mapping(&program(), &context(), None)
            .unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping[0].path, PathBuf::from("main.py"));
        assert_eq!(mapping[0].content, b"print(1)");
        assert!(!mapping[0].executable);
    }

    #[test]
    fn test_command_shape() {
        let executor = PodmanExecutor::new(PathBuf::from("/srv/wd"));
        let command = executor
            .command(Path::new("/srv/wd/abc"), &program(), &context())
            .unwrap();
        assert_eq!(command.argv[0], "podman");
        assert!(command.argv.contains(&"--rm".to_string()));
        assert!(command.argv.contains(&"128m".to_string()));
        assert!(command.argv.contains(&"/srv/wd/abc:/run".to_string()));
        assert!(command.argv.contains(&"5s".to_string()));
        assert_eq!(command.argv.last().unwrap(), "/run/main.py");
        assert!(command.env.is_empty());
    }
}

//! Host-local execution backend.
//!
//! Stages the program under `src/`, then generates a `run.sh` that creates a
//! private virtual environment with `uv`, installs declared requirements,
//! applies resource limits and runs the entrypoint. Nothing isolates the
//! program from the host beyond those limits, hence the name.

use std::path::{Path, PathBuf};

use crate::constants::DEFAULT_EXEC_PY_VERSION;
use crate::errors::RunnerError;
use crate::executor::{Executor, ExecutorCommand, PerfFiles};
use crate::models::{ComputeContext, Program};
use crate::workspace::{FilesystemMapping, MappedFile};

/// Minimal project manifest so that `uv` treats the workspace as a project.
const PYPROJECT: &str = r#"[project]
name = "unicon-run"
version = "0.1.0"
requires-python = ">=3.9"
dependencies = []
"#;

/// Runs programs directly on the host through a generated bootstrap script.
pub struct UnsafeExecutor {
    root_dir: PathBuf,
}

impl UnsafeExecutor {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    /// Interpreter handed to `uv venv --python`.
    ///
    /// Slurm nodes may only have the system interpreter; otherwise the job
    /// may pin a version, with a configured default as fallback.
    fn python_interpreter(context: &ComputeContext) -> String {
        if context.slurm && context.slurm_use_system_py {
            "/usr/bin/python".to_string()
        } else {
            context
                .extra_options
                .get("version")
                .cloned()
                .unwrap_or_else(|| DEFAULT_EXEC_PY_VERSION.clone())
        }
    }

    /// Render the bootstrap script staged as `run.sh`.
    ///
    /// The script resolves paths from its own location so that the same
    /// script works after being copied into a Slurm execution directory.
    /// The final exit code is always mirrored into an `exit_code` file:
    /// staging is identical for the unsafe and sandbox backends, and the
    /// sandbox wrapper swallows the process exit code.
    fn render_run_script(program: &Program, context: &ComputeContext, perf: Option<&PerfFiles>) -> String {
        let python = Self::python_interpreter(context);
        let mem_kb = context.memory_limit_mb * 1024;
        let time_secs = context.time_limit_secs;
        let entrypoint = &program.entrypoint;

        match perf {
            Some(perf) => {
                let create_venv = &perf.create_venv;
                let install_deps = &perf.install_deps;
                let program_file = &perf.program;
                format!(
                    r#"#!/usr/bin/env bash

cd "$(dirname "$(realpath "$0")")"

t0=$(date +%s%N)
uv venv --python {python} >/dev/null 2>&1
t1=$(date +%s%N)
uv pip install -r requirements.txt >/dev/null 2>&1
t2=$(date +%s%N)
echo $((t1 - t0)) > {create_venv}
echo $((t2 - t1)) > {install_deps}

ulimit -v {mem_kb}
t3=$(date +%s%N)
timeout --verbose --kill-after=1 {time_secs}s .venv/bin/python src/{entrypoint}
code=$?
t4=$(date +%s%N)
echo $((t4 - t3)) > {program_file}

echo $code > exit_code
exit $code
"#
                )
            }
            None => format!(
                r#"#!/usr/bin/env bash

cd "$(dirname "$(realpath "$0")")"

uv venv --python {python} >/dev/null 2>&1
uv pip install -r requirements.txt >/dev/null 2>&1

ulimit -v {mem_kb}
timeout --verbose --kill-after=1 {time_secs}s .venv/bin/python src/{entrypoint}
code=$?

echo $code > exit_code
exit $code
"#
            ),
        }
    }
}

impl Executor for UnsafeExecutor {
    fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn filesystem_mapping(
        &self,
        program: &Program,
        context: &ComputeContext,
        perf: Option<&PerfFiles>,
    ) -> Result<FilesystemMapping, RunnerError> {
        let mut mapping = Vec::with_capacity(program.files.len() + 4);
        for file in &program.files {
            mapping.push(MappedFile::new(
                Path::new("src").join(&file.name),
                file.decoded_data()?,
            ));
        }
        if !program.files.iter().any(|file| file.name == "__init__.py") {
            mapping.push(MappedFile::new("src/__init__.py", ""));
        }
        mapping.push(MappedFile::new("pyproject.toml", PYPROJECT));
        mapping.push(MappedFile::new(
            "requirements.txt",
            context
                .extra_options
                .get("requirements")
                .map(String::as_str)
                .unwrap_or(""),
        ));
        mapping.push(MappedFile::executable(
            "run.sh",
            Self::render_run_script(program, context, perf),
        ));
        Ok(mapping)
    }

    fn command(
        &self,
        workspace: &Path,
        _program: &Program,
        _context: &ComputeContext,
    ) -> Result<ExecutorCommand, RunnerError> {
        let mut command =
            ExecutorCommand::new(vec![workspace.join("run.sh").display().to_string()]);
        // Unset so that uv does not bind to an ambient virtual environment.
        command
            .env
            .insert("VIRTUAL_ENV".to_string(), String::new());
        Ok(command)
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
            files: vec![
                File {
                    name: "main.py".to_string(),
                    content: "print(1)".to_string(),
                    is_binary: false,
                },
                File {
                    name: "util.py".to_string(),
                    content: "x = 1".to_string(),
                    is_binary: false,
                },
            ],
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
    fn test_mapping_layout() {
        let executor = UnsafeExecutor::new(PathBuf::from("/srv/wd"));
        let mapping = executor
            .filesystem_mapping(&program(), &context(), None)
            .unwrap();
        let paths: Vec<_> = mapping.iter().map(|f| f.path.to_str().unwrap()).collect();
        assert_eq!(
            paths,
            vec![
                "src/main.py",
                "src/util.py",
                "src/__init__.py",
                "pyproject.toml",
                "requirements.txt",
                "run.sh",
            ]
        );
        assert!(mapping.last().unwrap().executable);
    }

    #[test]
    fn test_mapping_does_not_duplicate_init_py() {
        let mut program = program();
        program.files.push(File {
            name: "__init__.py".to_string(),
            content: "VERSION = 1".to_string(),
            is_binary: false,
        });
        let executor = UnsafeExecutor::new(PathBuf::from("/srv/wd"));
        let mapping = executor
            .filesystem_mapping(&program, &context(), None)
            .unwrap();
        let init_count = mapping
            .iter()
            .filter(|f| f.path == Path::new("src/__init__.py"))
            .count();
        assert_eq!(init_count, 1);
    }

    #[test]
    fn test_mapping_carries_requirements() {
        let mut ctx = context();
        ctx.extra_options
            .insert("requirements".to_string(), "numpy==2.0.0".to_string());
        let executor = UnsafeExecutor::new(PathBuf::from("/srv/wd"));
        let mapping = executor
            .filesystem_mapping(&program(), &ctx, None)
            .unwrap();
        let requirements = mapping
            .iter()
            .find(|f| f.path == Path::new("requirements.txt"))
            .unwrap();
        assert_eq!(requirements.content, b"numpy==2.0.0");
    }

    #[test]
    fn test_run_script_limits_and_entrypoint() {
        let script = UnsafeExecutor::render_run_script(&program(), &context(), None);
        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert!(script.contains("uv venv --python 3.11.9"));
        assert!(script.contains("ulimit -v 131072"));
        assert!(script.contains("timeout --verbose --kill-after=1 5s .venv/bin/python src/main.py"));
        assert!(script.contains("echo $code > exit_code"));
        assert!(!script.contains("date +%s%N"));
    }

    #[test]
    fn test_run_script_perf_instrumentation() {
        let perf = PerfFiles::default();
        let script = UnsafeExecutor::render_run_script(&program(), &context(), Some(&perf));
        assert!(script.contains("date +%s%N"));
        assert!(script.contains("> .create_venv_time_ns"));
        assert!(script.contains("> .install_deps_time_ns"));
        assert!(script.contains("> .program_time_ns"));
    }

    #[test]
    fn test_python_interpreter_selection() {
        let mut ctx = context();
        assert_eq!(UnsafeExecutor::python_interpreter(&ctx), "3.11.9");

        ctx.extra_options
            .insert("version".to_string(), "3.12.1".to_string());
        assert_eq!(UnsafeExecutor::python_interpreter(&ctx), "3.12.1");

        ctx.slurm = true;
        ctx.slurm_use_system_py = true;
        assert_eq!(UnsafeExecutor::python_interpreter(&ctx), "/usr/bin/python");
    }

    #[test]
    fn test_command_unsets_virtual_env() {
        let executor = UnsafeExecutor::new(PathBuf::from("/srv/wd"));
        let command = executor
            .command(Path::new("/srv/wd/abc"), &program(), &context())
            .unwrap();
        assert_eq!(command.argv, vec!["/srv/wd/abc/run.sh".to_string()]);
        assert_eq!(command.env.get("VIRTUAL_ENV"), Some(&String::new()));
    }
}

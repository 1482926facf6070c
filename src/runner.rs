//! Per-program execution pipeline and job fan-out.
//!
//! Binds the pieces together: allocate a workspace, stage the executor's
//! filesystem mapping, synthesize the launch command (locally or through
//! Slurm), run the child with captured output, classify the exit code and
//! assemble the outbound result. A workspace is removed only after a fully
//! successful run; anything that errors leaves it behind for inspection.

use std::fs;
use std::path::Path;
use std::process::Stdio;

use futures::future::try_join_all;
use tokio::process::Command;
use tracing::debug;

use crate::errors::RunnerError;
use crate::executor::{Executor, ExecutorCommand, PerfFiles};
use crate::models::{
    ComputeContext, ExecutorPerf, ExecutorResult, Job, Program, ProgramResult, Status,
};
use crate::slurm;
use crate::workspace::{new_workspace_id, stage_files, Workspace};

/// Knobs for a single program run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Remove the workspace after a successful run.
    pub cleanup: bool,
    /// Record per-phase timings alongside the program.
    pub track_perf: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cleanup: true,
            track_perf: true,
        }
    }
}

/// Run one program to completion and classify its outcome.
pub async fn run_program(
    executor: &dyn Executor,
    program: &Program,
    context: &ComputeContext,
    options: &RunOptions,
) -> Result<ProgramResult, RunnerError> {
    let id = new_workspace_id();
    let workspace = Workspace::create(executor.root_dir(), &id)?;
    debug!(%id, "allocated workspace");

    let perf_files = options.track_perf.then(PerfFiles::default);
    let mapping = executor.filesystem_mapping(program, context, perf_files.as_ref())?;
    stage_files(&workspace, &mapping)?;

    let command = if context.slurm {
        // The exit_code file must travel back from the node-local execution
        // directory for sandbox collection to work.
        let mut preserve = vec!["exit_code".to_string()];
        if let Some(perf) = &perf_files {
            preserve.extend(perf.names().into_iter().map(str::to_string));
        }
        slurm::wrap(executor, workspace.path(), &id, program, context, &preserve)?
    } else {
        executor.command(workspace.path(), program, context)?
    };
    debug!(argv = ?command.argv, "launching program");

    let result = launch_and_collect(executor, workspace.path(), &command).await?;
    let status = Status::from_exit_code(result.exit_code);
    let perf = perf_files
        .as_ref()
        .map(|perf| read_perf(workspace.path(), perf));
    debug!(%id, %status, exit_code = result.exit_code, "program finished");

    if options.cleanup {
        workspace.remove()?;
    }

    Ok(ProgramResult {
        status,
        stdout: result.stdout,
        stderr: result.stderr,
        elapsed_time_ns: perf.map(|perf| perf.program_ns),
        tracking: program.tracking.clone(),
    })
}

/// Run every program of a job concurrently.
///
/// Results come back in the job's declared order regardless of completion
/// order; the first failing program cancels its siblings and becomes the
/// job error. Program-level verdicts (MLE/TLE/RTE) are results, not
/// failures.
pub async fn run_job(executor: &dyn Executor, job: &Job) -> Result<Vec<ProgramResult>, RunnerError> {
    let options = RunOptions::default();
    try_join_all(
        job.programs
            .iter()
            .map(|program| run_program(executor, program, &job.context, &options)),
    )
    .await
}

async fn launch_and_collect(
    executor: &dyn Executor,
    workspace: &Path,
    command: &ExecutorCommand,
) -> Result<ExecutorResult, RunnerError> {
    let (argv0, args) = command
        .argv
        .split_first()
        .ok_or_else(|| RunnerError::Execution("empty argv".to_string()))?;

    let mut cmd = Command::new(argv0);
    cmd.args(args)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let _guard = match executor.spawn_lock() {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };
    let child = cmd
        .spawn()
        .map_err(|err| RunnerError::Execution(format!("failed to spawn {argv0}: {err}")))?;
    executor.collect(workspace, child).await
}

/// Read the recorded per-phase timings; missing or malformed files count
/// as zero.
fn read_perf(workspace: &Path, perf: &PerfFiles) -> ExecutorPerf {
    let read_ns = |name: &str| -> u64 {
        fs::read_to_string(workspace.join(name))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    };
    ExecutorPerf {
        create_venv_ns: read_ns(&perf.create_venv),
        install_deps_ns: read_ns(&perf.install_deps),
        program_ns: read_ns(&perf.program),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_perf_missing_and_malformed_are_zero() {
        let dir = TempDir::new().unwrap();
        let perf = PerfFiles::default();
        fs::write(dir.path().join(&perf.create_venv), "1200\n").unwrap();
        fs::write(dir.path().join(&perf.install_deps), "garbage").unwrap();

        let read = read_perf(dir.path(), &perf);
        assert_eq!(read.create_venv_ns, 1200);
        assert_eq!(read.install_deps_ns, 0);
        assert_eq!(read.program_ns, 0);
    }
}

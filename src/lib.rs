//! Unicon Runner - a job execution worker for code grading.
//!
//! Consumes jobs from an AMQP task queue, executes each job's programs
//! concurrently under an isolation backend with memory and wall-time
//! limits, classifies outcomes by exit code and publishes structured
//! results to a result queue.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Job dispatcher                           │
//! │  - One AMQP connection, prefetch 1 (one job in flight)           │
//! │  - Decodes Jobs, checks executor compatibility                   │
//! │  - Fans programs out concurrently, publishes JobResults          │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Execution backends                         │
//! │  - podman: container with memory cap + `timeout`                 │
//! │  - unsafe: host-local uv venv, ulimit + `timeout`                │
//! │  - sandbox: unsafe wrapped by conty bind mounts                  │
//! │  - optional Slurm dispatch: NFS staging + generated srun script  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Exit-code contract of the effective child program: 124 is a time-limit
//! verdict, 137 a memory-limit verdict, 1 a runtime error, anything else
//! (including 0) is OK. Downstream graders rely on this mapping.

mod constants;
mod errors;
mod executor;
mod helpers;
mod models;
mod runner;
mod slurm;
mod worker;
mod workspace;

pub use errors::RunnerError;
pub use executor::{
    create_executor, Executor, ExecutorCommand, ExecutorKind, PerfFiles, PodmanExecutor,
    SandboxExecutor, UnsafeExecutor,
};
pub use models::{
    is_safe_filename, ComputeContext, ExecutorPerf, ExecutorResult, File, Job, JobResult,
    Language, Program, ProgramResult, Status, TrackingFields,
};
pub use runner::{run_job, run_program, RunOptions};
pub use slurm::is_nfs_backed;
pub use worker::Worker;
pub use workspace::{new_workspace_id, stage_files, FilesystemMapping, MappedFile, Workspace};

//! Data model for jobs, programs and results.
//!
//! All broker payloads are UTF-8 JSON. Jobs and programs carry opaque
//! "tracking fields": extra JSON keys the task scheduler uses to reconcile
//! results with submissions. The runner is not concerned with them beyond
//! capturing them on decode and echoing them verbatim onto the corresponding
//! result.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::errors::RunnerError;

/// Extra JSON keys preserved alongside the validated payload.
pub type TrackingFields = serde_json::Map<String, serde_json::Value>;

/// A single file of a program's filesystem tree.
///
/// Older submitter revisions named the field `path` or `file_name`; all
/// spellings are accepted on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    /// Plain file name; path separators are rejected on validation.
    #[serde(alias = "path", alias = "file_name")]
    pub name: String,
    /// File contents; base64 when `is_binary`.
    pub content: String,
    #[serde(default)]
    pub is_binary: bool,
}

impl File {
    /// Effective bytes to stage: base64-decoded (strict) when `is_binary`,
    /// the UTF-8 bytes of `content` otherwise.
    pub fn decoded_data(&self) -> Result<Vec<u8>, RunnerError> {
        if self.is_binary {
            base64::engine::general_purpose::STANDARD
                .decode(self.content.as_bytes())
                .map_err(|err| {
                    RunnerError::InvalidJob(format!("invalid base64 content in {}: {err}", self.name))
                })
        } else {
            Ok(self.content.clone().into_bytes())
        }
    }
}

/// Device names reserved by Windows; staged trees may be synced to or
/// inspected from any host, so they are rejected outright.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Whether `name` is a plain, non-escaping filename.
///
/// Rejects path separators, control characters, characters and reserved
/// device names not portable across filesystems, trailing dots/spaces and
/// overlength names.
pub fn is_safe_filename(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." || name.len() > 255 {
        return false;
    }
    if name.contains(['/', '\\', ':', '*', '?', '"', '<', '>', '|'])
        || name.chars().any(|c| c.is_ascii_control())
    {
        return false;
    }
    if name.ends_with('.') || name.ends_with(' ') {
        return false;
    }
    // Windows reserves device names with any extension (e.g. "NUL.txt").
    let stem = name.split('.').next().unwrap_or(name);
    !RESERVED_NAMES
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
}

/// Languages the runner can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Language {
    Python,
}

/// Execution constraints and options shared by all programs of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeContext {
    pub language: Language,
    /// Wall-clock limit in seconds; must be positive.
    pub time_limit_secs: f64,
    /// Memory cap in megabytes; must be positive.
    pub memory_limit_mb: u64,

    /// Dispatch programs through Slurm instead of launching locally.
    #[serde(default)]
    pub slurm: bool,
    /// Additional options for `srun`, e.g. `["--gpus", "1"]`.
    #[serde(default)]
    pub slurm_options: Vec<String>,
    /// Use the python interpreter present on the allocated Slurm node,
    /// ignoring any version pinned under `extra_options`.
    #[serde(default)]
    pub slurm_use_system_py: bool,

    /// Free-form options; `"version"` and `"requirements"` are understood.
    #[serde(default)]
    pub extra_options: BTreeMap<String, String>,
}

/// A self-contained filesystem tree plus an entrypoint file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub entrypoint: String,
    pub files: Vec<File>,

    /// Tracking fields passed through to the [`ProgramResult`].
    #[serde(flatten)]
    pub tracking: TrackingFields,
}

impl Program {
    fn validate(&self) -> Result<(), RunnerError> {
        for file in &self.files {
            if !is_safe_filename(&file.name) {
                return Err(RunnerError::InvalidJob(format!(
                    "{} is an invalid file name",
                    file.name
                )));
            }
        }
        if !self.files.iter().any(|file| file.name == self.entrypoint) {
            return Err(RunnerError::InvalidJob(format!(
                "entrypoint {} not found in program files",
                self.entrypoint
            )));
        }
        Ok(())
    }
}

/// One unit of work delivered by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub context: ComputeContext,
    pub programs: Vec<Program>,

    /// Tracking fields passed through to the [`JobResult`].
    #[serde(flatten)]
    pub tracking: TrackingFields,
}

impl Job {
    /// Decode a job from a JSON message body and check model invariants.
    pub fn from_json(body: &[u8]) -> Result<Self, RunnerError> {
        let job: Job =
            serde_json::from_slice(body).map_err(|err| RunnerError::InvalidJob(err.to_string()))?;
        job.validate()?;
        Ok(job)
    }

    fn validate(&self) -> Result<(), RunnerError> {
        if !(self.context.time_limit_secs > 0.0) {
            return Err(RunnerError::InvalidJob(
                "time_limit_secs must be positive".to_string(),
            ));
        }
        if self.context.memory_limit_mb == 0 {
            return Err(RunnerError::InvalidJob(
                "memory_limit_mb must be positive".to_string(),
            ));
        }
        for program in &self.programs {
            program.validate()?;
        }
        Ok(())
    }
}

/// Job-observable verdict for one program.
///
/// `Wa` is reserved for a grading layer downstream; the runner never
/// produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Mle,
    Tle,
    Rte,
    Wa,
}

impl Status {
    /// Classify a child exit code.
    ///
    /// 124 comes from `timeout`, 137 from SIGKILL (kernel OOM or
    /// `timeout --kill-after`). Every other code, including 0, is OK:
    /// whether output is *correct* is not the runner's concern.
    pub fn from_exit_code(exit_code: i32) -> Self {
        match exit_code {
            137 => Status::Mle,
            124 => Status::Tle,
            1 => Status::Rte,
            _ => Status::Ok,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Mle => "MLE",
            Status::Tle => "TLE",
            Status::Rte => "RTE",
            Status::Wa => "WA",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-phase timings recorded by the generated run script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorPerf {
    pub create_venv_ns: u64,
    pub install_deps_ns: u64,
    pub program_ns: u64,
}

/// Normalized outcome of one child process.
#[derive(Debug, Clone)]
pub struct ExecutorResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Outcome of one program run, published as part of a [`JobResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramResult {
    pub status: Status,
    pub stdout: String,
    pub stderr: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time_ns: Option<u64>,

    /// Tracking fields copied verbatim from the program.
    #[serde(flatten)]
    pub tracking: TrackingFields,
}

/// Aggregate outcome of one job, published to the result queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub error: Option<String>,
    /// One entry per program, in the job's declared order.
    pub results: Vec<ProgramResult>,

    /// Tracking fields copied verbatim from the job.
    #[serde(flatten)]
    pub tracking: TrackingFields,
}

//! Error types for the unicon runner.

use thiserror::Error;

/// Unicon runner error.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Required configuration is missing or unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Inbound job failed to decode or violated a model invariant.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Workspace could not be created or removed.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// Filesystem staging failed or a mapping was rejected.
    #[error("staging failed: {0}")]
    Staging(String),

    /// Child process could not be launched or drained.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Sandbox binary could not be obtained.
    #[error("download failed: {0}")]
    Download(String),

    /// Message broker failure.
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

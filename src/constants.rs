//! Environment-backed configuration.
//!
//! Values are read once from the process environment; an empty variable is
//! treated as unset.

use std::env;
use std::sync::LazyLock;

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_var_or(name: &str, default: &str) -> String {
    env_var(name).unwrap_or_else(|| default.to_string())
}

/// AMQP broker URL. Required by `start`; checked at worker construction.
pub static AMQP_URL: LazyLock<Option<String>> = LazyLock::new(|| env_var("AMQP_URL"));

/// Topic exchange both queues are bound to.
pub static AMQP_EXCHANGE_NAME: LazyLock<String> =
    LazyLock::new(|| env_var_or("AMQP_EXCHANGE_NAME", "unicon"));

/// Durable queue jobs are consumed from (also its routing key).
pub static AMQP_TASK_QUEUE_NAME: LazyLock<String> =
    LazyLock::new(|| env_var_or("AMQP_TASK_QUEUE_NAME", "unicon.tasks"));

/// Durable queue results are published to (also its routing key).
pub static AMQP_RESULT_QUEUE_NAME: LazyLock<String> =
    LazyLock::new(|| env_var_or("AMQP_RESULT_QUEUE_NAME", "unicon.results"));

/// Connection name reported to the broker.
pub static AMQP_CONN_NAME: LazyLock<String> =
    LazyLock::new(|| env_var_or("AMQP_CONN_NAME", "unicon-runner"));

/// Python version used when a job does not pin one.
pub static DEFAULT_EXEC_PY_VERSION: LazyLock<String> =
    LazyLock::new(|| env_var_or("DEFAULT_EXEC_PY_VERSION", "3.11.9"));

/// Baseline `srun` options, whitespace-separated in the environment.
pub static DEFAULT_SLURM_OPTS: LazyLock<Vec<String>> = LazyLock::new(|| {
    env_var_or("DEFAULT_SLURM_OPTS", "")
        .split_whitespace()
        .map(str::to_string)
        .collect()
});

/// Location of the conty sandbox binary.
pub static CONTY_PATH: LazyLock<String> = LazyLock::new(|| env_var_or("CONTY_PATH", "conty.sh"));

/// Where to fetch conty from when it is missing at [`CONTY_PATH`].
pub static CONTY_DOWNLOAD_URL: LazyLock<String> = LazyLock::new(|| {
    env_var_or(
        "CONTY_DOWNLOAD_URL",
        "https://github.com/uniconhq/conty/releases/latest/download/conty.sh",
    )
});

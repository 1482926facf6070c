//! Unicon Runner CLI
//!
//! Worker service that executes code-grading jobs under isolation backends.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use tracing::info;
use unicon_runner::{
    create_executor, run_program, ExecutorKind, Job, RunOptions, Worker,
};

fn print_usage() {
    eprintln!("Unicon Runner - job execution worker");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  unicon-runner start <exec-type> <root-wd-dir>");
    eprintln!("  unicon-runner test <exec-type> <root-wd-dir> <job-file> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  start         Run as a worker against the configured AMQP broker");
    eprintln!("  test          Run a job from a file, keeping workspaces for inspection");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <exec-type>   Executor backend: podman, unsafe or sandbox");
    eprintln!("  <root-wd-dir> Existing writable root for per-run working directories");
    eprintln!("  <job-file>    JSON job description");
    eprintln!();
    eprintln!("Options (test):");
    eprintln!("  --slurm                  Dispatch programs through Slurm");
    eprintln!("  --slurm-opt <opt>        Extra srun option (repeatable)");
    eprintln!("  --slurm-use-system-py    Use the Slurm node's system python");
    eprintln!("  --exec-py-version <v>    Override the python version");
    eprintln!("  --help, -h               Show help");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "start" => cmd_start(&args[2..]).await,
        "test" => cmd_test(&args[2..]).await,
        "--help" | "-h" => print_usage(),
        command => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            process::exit(1);
        }
    }
}

fn parse_executor_args(args: &[String]) -> (ExecutorKind, PathBuf) {
    if args.len() < 2 {
        eprintln!("Missing <exec-type> or <root-wd-dir>");
        print_usage();
        process::exit(1);
    }
    let kind = ExecutorKind::from_str(&args[0]).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let root = PathBuf::from(&args[1]);
    if !root.is_dir() {
        eprintln!("Root working directory {} does not exist", root.display());
        process::exit(1);
    }
    let writable = fs::metadata(&root)
        .map(|meta| !meta.permissions().readonly())
        .unwrap_or(false);
    if !writable {
        eprintln!("Root working directory {} is not writable", root.display());
        process::exit(1);
    }
    (kind, root)
}

async fn cmd_start(args: &[String]) {
    let (kind, root) = parse_executor_args(args);

    let worker = match Worker::connect().await {
        Ok(worker) => worker,
        Err(err) => {
            eprintln!("Failed to set up task and result queues: {}", err);
            process::exit(1);
        }
    };
    info!("initialized task and result queues");

    let executor = match create_executor(kind, root.clone()).await {
        Ok(executor) => executor,
        Err(err) => {
            eprintln!("Failed to create executor: {}", err);
            process::exit(1);
        }
    };
    info!(executor = kind.as_str(), root = %root.display(), "created executor");

    if let Err(err) = worker.run(executor.as_ref()).await {
        eprintln!("Worker stopped: {}", err);
        process::exit(1);
    }
}

async fn cmd_test(args: &[String]) {
    if args.len() < 3 {
        eprintln!("Missing <exec-type>, <root-wd-dir> or <job-file>");
        print_usage();
        process::exit(1);
    }
    let (kind, root) = parse_executor_args(&args[..2]);
    let job_file = PathBuf::from(&args[2]);

    let mut slurm = false;
    let mut slurm_opts: Vec<String> = Vec::new();
    let mut slurm_use_system_py = false;
    let mut exec_py_version: Option<String> = None;

    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--slurm" => {
                slurm = true;
            }
            "--slurm-opt" => {
                i += 1;
                match args.get(i) {
                    Some(opt) => slurm_opts.push(opt.clone()),
                    None => {
                        eprintln!("Missing value for --slurm-opt");
                        process::exit(1);
                    }
                }
            }
            "--slurm-use-system-py" => {
                slurm_use_system_py = true;
            }
            "--exec-py-version" => {
                i += 1;
                exec_py_version = match args.get(i) {
                    Some(version) => Some(version.clone()),
                    None => {
                        eprintln!("Missing value for --exec-py-version");
                        process::exit(1);
                    }
                };
            }
            option => {
                eprintln!("Unknown option: {}", option);
                process::exit(1);
            }
        }
        i += 1;
    }

    let body = fs::read(&job_file).unwrap_or_else(|err| {
        eprintln!("Failed to read {}: {}", job_file.display(), err);
        process::exit(1);
    });
    let mut job = Job::from_json(&body).unwrap_or_else(|err| {
        eprintln!("Failed to decode {}: {}", job_file.display(), err);
        process::exit(1);
    });

    // Flags override the job file only when provided.
    job.context.slurm = slurm || job.context.slurm;
    if !slurm_opts.is_empty() {
        job.context.slurm_options = slurm_opts;
    }
    job.context.slurm_use_system_py = slurm_use_system_py || job.context.slurm_use_system_py;
    if let Some(version) = exec_py_version {
        job.context.extra_options.insert("version".to_string(), version);
    }

    let executor = match create_executor(kind, root).await {
        Ok(executor) => executor,
        Err(err) => {
            eprintln!("Failed to create executor: {}", err);
            process::exit(1);
        }
    };

    // Workspaces are kept so the staged files and the execution can be
    // inspected and replayed.
    let options = RunOptions {
        cleanup: false,
        ..Default::default()
    };

    for (i, program) in job.programs.iter().enumerate() {
        match run_program(executor.as_ref(), program, &job.context, &options).await {
            Ok(result) => {
                println!();
                println!("Program Result #{} [{}]", i + 1, result.status);
                if let Some(elapsed_ns) = result.elapsed_time_ns {
                    println!("elapsed: {} ms", elapsed_ns / 1_000_000);
                }
                println!("--- stdout ---");
                print!("{}", result.stdout);
                println!("--- stderr ---");
                print!("{}", result.stderr);
            }
            Err(err) => {
                eprintln!("Program #{} failed: {}", i + 1, err);
                process::exit(1);
            }
        }
    }
}

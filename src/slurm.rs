//! Slurm-aware staging and dispatch.
//!
//! When a job demands Slurm, staging happens on an NFS-backed workspace the
//! allocated node can see, while execution happens in a node-local directory
//! under `/tmp`. A generated `slurm.sh` bridges the two: it copies staged
//! files into the execution directory, applies the backend's environment,
//! runs the backend command and copies designated artifacts back before
//! exiting with the command's code.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::constants::DEFAULT_SLURM_OPTS;
use crate::errors::RunnerError;
use crate::executor::{Executor, ExecutorCommand};
use crate::models::{ComputeContext, Program};

/// Whether `path` resides on an NFS-type filesystem.
///
/// Heuristic: the device id of `path` matches a mount whose filesystem type
/// starts with `nfs` in `/proc/self/mountinfo`.
pub fn is_nfs_backed(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let Ok(mountinfo) = fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };
    nfs_mount_points(&mountinfo).iter().any(|mount_point| {
        fs::metadata(mount_point)
            .map(|m| m.dev() == metadata.dev())
            .unwrap_or(false)
    })
}

/// Mount points of NFS-type filesystems, parsed from mountinfo content.
fn nfs_mount_points(mountinfo: &str) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| {
            // Optional fields end at the " - " separator; the filesystem
            // type is the first field after it.
            let (mount_fields, fs_fields) = line.split_once(" - ")?;
            let fs_type = fs_fields.split_whitespace().next()?;
            if !fs_type.starts_with("nfs") {
                return None;
            }
            let mount_point = mount_fields.split_whitespace().nth(4)?;
            Some(PathBuf::from(mount_point))
        })
        .collect()
}

/// Quote a string for safe interpolation into the generated script.
fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':'));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Rewrite a backend command for dispatch through the cluster launcher.
///
/// Renders `slurm.sh` under `staging_dir` and returns the `srun` invocation
/// that submits it. The backend command is synthesized as if it were
/// launching locally at the node-local execution directory `/tmp/{id}`; its
/// environment overrides are embedded in the script as exports, so the
/// returned command carries none.
pub fn wrap(
    executor: &dyn Executor,
    staging_dir: &Path,
    id: &str,
    program: &Program,
    context: &ComputeContext,
    preserve: &[String],
) -> Result<ExecutorCommand, RunnerError> {
    let exec_dir = PathBuf::from("/tmp").join(id);
    let local = executor.command(&exec_dir, program, context)?;

    let script = render_submission_script(staging_dir, &exec_dir, &local, preserve);
    let script_path = staging_dir.join("slurm.sh");
    fs::write(&script_path, script)?;
    fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;

    let mut argv = vec!["srun".to_string(), "--quiet".to_string()];
    argv.extend(DEFAULT_SLURM_OPTS.iter().cloned());
    argv.extend(context.slurm_options.iter().cloned());
    argv.push(script_path.display().to_string());

    Ok(ExecutorCommand {
        argv,
        env: BTreeMap::new(),
    })
}

fn render_submission_script(
    staging_dir: &Path,
    exec_dir: &Path,
    command: &ExecutorCommand,
    preserve: &[String],
) -> String {
    let staging = shell_quote(&staging_dir.display().to_string());
    let exec = shell_quote(&exec_dir.display().to_string());

    let exports: String = command
        .env
        .iter()
        .map(|(key, value)| format!("export {key}={}\n", shell_quote(value)))
        .collect();
    let run_line: String = command
        .argv
        .iter()
        .map(|word| shell_quote(word))
        .collect::<Vec<_>>()
        .join(" ");
    let copy_back: String = preserve
        .iter()
        .map(|name| {
            let name = shell_quote(name);
            format!("cp {exec}/{name} {staging}/{name} 2>/dev/null\n")
        })
        .collect();

    format!(
        r#"#!/usr/bin/env bash

mkdir -p {exec}
cp -r {staging}/. {exec}/

{exports}
{run_line}
code=$?

{copy_back}
exit $code
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime - ext4 /dev/sda1 rw
40 22 0:36 / /srv/cluster rw,relatime - nfs4 fs1:/export rw,vers=4.2
41 22 0:37 / /scratch rw,relatime - nfs fs2:/scratch rw
42 22 0:40 / /sys/fs/cgroup ro - cgroup2 cgroup2 rw
";

    #[test]
    fn test_nfs_mount_points() {
        let points = nfs_mount_points(MOUNTINFO);
        assert_eq!(
            points,
            vec![PathBuf::from("/srv/cluster"), PathBuf::from("/scratch")]
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-word_1.0/x"), "plain-word_1.0/x");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_submission_script_shape() {
        let mut env = BTreeMap::new();
        env.insert("VIRTUAL_ENV".to_string(), String::new());
        let command = ExecutorCommand {
            argv: vec!["/tmp/abc/run.sh".to_string()],
            env,
        };
        let script = render_submission_script(
            Path::new("/srv/cluster/wd/abc"),
            Path::new("/tmp/abc"),
            &command,
            &["exit_code".to_string(), ".program_time_ns".to_string()],
        );

        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert!(script.contains("mkdir -p /tmp/abc"));
        assert!(script.contains("cp -r /srv/cluster/wd/abc/. /tmp/abc/"));
        assert!(script.contains("export VIRTUAL_ENV=''"));
        assert!(script.contains("/tmp/abc/run.sh\ncode=$?"));
        assert!(script.contains("cp /tmp/abc/exit_code /srv/cluster/wd/abc/exit_code"));
        assert!(script.contains("cp /tmp/abc/.program_time_ns /srv/cluster/wd/abc/.program_time_ns"));
        assert!(script.trim_end().ends_with("exit $code"));
    }
}

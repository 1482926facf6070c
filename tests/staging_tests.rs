//! Staging Tests
//!
//! Verifies that the unsafe backend's declared filesystem mapping lands on
//! disk byte-exact, with the expected layout and permission bits.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use tempfile::TempDir;
use unicon_runner::{
    new_workspace_id, stage_files, ComputeContext, Executor, File, Language, Program,
    UnsafeExecutor, Workspace,
};

fn context() -> ComputeContext {
    ComputeContext {
        language: Language::Python,
        time_limit_secs: 5.0,
        memory_limit_mb: 64,
        slurm: false,
        slurm_options: vec![],
        slurm_use_system_py: false,
        extra_options: Default::default(),
    }
}

#[test]
fn test_unsafe_staged_layout() {
    let root = TempDir::new().unwrap();
    let executor = UnsafeExecutor::new(root.path().to_path_buf());
    let program = Program {
        entrypoint: "main.py".to_string(),
        files: vec![
            File {
                name: "main.py".to_string(),
                content: "print(1 + 1)".to_string(),
                is_binary: false,
            },
            // 0x00 0x01 0x02, base64-encoded.
            File {
                name: "data.bin".to_string(),
                content: "AAEC".to_string(),
                is_binary: true,
            },
        ],
        tracking: Default::default(),
    };

    let workspace = Workspace::create(root.path(), &new_workspace_id()).unwrap();
    let mapping = executor
        .filesystem_mapping(&program, &context(), None)
        .unwrap();
    stage_files(&workspace, &mapping).unwrap();

    // Every mapped file lands byte-exact with the declared executable bit.
    for file in &mapping {
        let staged = workspace.path().join(&file.path);
        assert_eq!(fs::read(&staged).unwrap(), file.content, "{}", staged.display());
        let mode = fs::metadata(&staged).unwrap().permissions().mode();
        assert_eq!(mode & 0o100 != 0, file.executable, "{}", staged.display());
    }

    assert_eq!(
        fs::read(workspace.path().join("src/main.py")).unwrap(),
        b"print(1 + 1)"
    );
    assert_eq!(
        fs::read(workspace.path().join("src/data.bin")).unwrap(),
        vec![0u8, 1, 2]
    );
    assert_eq!(fs::read(workspace.path().join("src/__init__.py")).unwrap(), b"");
    assert!(workspace.path().join("pyproject.toml").is_file());
    assert!(workspace.path().join("requirements.txt").is_file());

    let run_sh = fs::read_to_string(workspace.path().join("run.sh")).unwrap();
    assert!(run_sh.contains("timeout --verbose --kill-after=1 5s"));
    assert!(run_sh.contains("ulimit -v 65536"));
}

#[test]
fn test_concurrent_workspaces_do_not_collide() {
    let root = TempDir::new().unwrap();
    let first = Workspace::create(root.path(), &new_workspace_id()).unwrap();
    let second = Workspace::create(root.path(), &new_workspace_id()).unwrap();
    assert_ne!(first.path(), second.path());
    assert!(first.path().is_dir());
    assert!(second.path().is_dir());
}

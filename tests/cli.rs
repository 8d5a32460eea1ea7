//! End-to-end tests of the CLI surface, driving the built binary the way an
//! operator would.

use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("couldn't run git");
    assert!(status.success(), "git {args:?} failed");
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "drover@example.com"]);
    git(dir, &["config", "user.name", "drover tests"]);
    git(dir, &["commit", "--allow-empty", "-m", "init"]);
}

fn porcelain(dir: &Path) -> String {
    let output = Command::new("git")
        .args(["status", "--porcelain=v1"])
        .current_dir(dir)
        .output()
        .expect("couldn't run git status");
    String::from_utf8(output.stdout).unwrap()
}

fn log_subjects(dir: &Path) -> String {
    let output = Command::new("git")
        .args(["log", "--format=%s"])
        .current_dir(dir)
        .output()
        .expect("couldn't run git log");
    String::from_utf8(output.stdout).unwrap()
}

// A stand-in sub-agent honoring the `-o <sink> -` convention.
fn stub_agent(dir: &Path) -> PathBuf {
    let path = dir.join("agent.sh");
    fs::write(
        &path,
        "#!/bin/bash\n\
         out=\"\"\n\
         while [ $# -gt 0 ]; do\n\
           case \"$1\" in\n\
             -o) out=\"$2\"; shift 2;;\n\
             *) shift;;\n\
           esac\n\
         done\n\
         cat > /dev/null\n\
         echo \"All done, no blockers.\" > \"$out\"\n",
    )
    .unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

#[test]
fn test_dry_run_mutates_nothing() {
    let dir = TempDir::new().unwrap();
    init_repo(dir.path());
    let queue_path = dir.path().join("tasks.json");
    fs::write(
        &queue_path,
        r#"[
            {"id": "A", "type": "code", "worktree": "work/A", "order": 10},
            {"id": "B", "type": "test", "order": 20, "depends_on": ["A"]}
        ]"#,
    )
    .unwrap();
    let queue_before = fs::read(&queue_path).unwrap();
    let status_before = porcelain(dir.path());

    let output = test_bin::get_test_bin("drover")
        .args(["--repo-root", dir.path().to_str().unwrap()])
        .args(["--queue", queue_path.to_str().unwrap()])
        .arg("--dry-run")
        .output()
        .expect("couldn't run drover");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("DRY RUN: would spawn A (WS-CODE)"), "stdout: {stdout}");
    // B's dependency hasn't completed, so only A is planned.
    assert!(!stdout.contains("would spawn B"));

    assert_eq!(fs::read(&queue_path).unwrap(), queue_before);
    assert_eq!(porcelain(dir.path()), status_before);
    assert!(!dir.path().join(".runs").exists());
    assert!(!dir.path().join("session_log.md").exists());
    assert!(!dir.path().join("work").exists());
}

#[test]
fn test_unknown_flag_exits_2() {
    let output = test_bin::get_test_bin("drover")
        .arg("--definitely-not-a-flag")
        .output()
        .expect("couldn't run drover");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_queue_flag_exits_2() {
    let output = test_bin::get_test_bin("drover")
        .output()
        .expect("couldn't run drover");
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--queue is required"));
}

#[test]
fn test_queue_parse_error_is_fatal_before_mutation() {
    let dir = TempDir::new().unwrap();
    init_repo(dir.path());
    let queue_path = dir.path().join("tasks.json");
    fs::write(&queue_path, "this is not json").unwrap();

    let output = test_bin::get_test_bin("drover")
        .args(["--repo-root", dir.path().to_str().unwrap()])
        .args(["--queue", queue_path.to_str().unwrap()])
        .output()
        .expect("couldn't run drover");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("parsing queue file"));
    assert!(!dir.path().join(".runs").exists());
    assert_eq!(log_subjects(dir.path()), "init\n");
}

// Full drain through the real CLI: one rootless task, stub agent, clean
// exit, docs commits in history.
#[test]
fn test_drains_rootless_queue() {
    let dir = TempDir::new().unwrap();
    init_repo(dir.path());
    let queue_path = dir.path().join("tasks.json");
    fs::write(
        &queue_path,
        r#"[{"id": "T-1", "worktree": "N/A", "kickoff_prompt": "Survey the repo."}]"#,
    )
    .unwrap();
    let agent = stub_agent(dir.path());

    let output = test_bin::get_test_bin("drover")
        .args(["--repo-root", dir.path().to_str().unwrap()])
        .args(["--queue", queue_path.to_str().unwrap()])
        .args(["--codex-cmd", agent.to_str().unwrap()])
        .args(["--watch-timeout-s", "2"])
        .output()
        .expect("couldn't run drover");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("DONE:"));

    let queue: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&queue_path).unwrap()).unwrap();
    assert_eq!(queue[0]["status"], "completed");
    assert!(queue[0]["completed_at"].as_str().unwrap().ends_with('Z'));

    let subjects = log_subjects(dir.path());
    assert!(subjects.contains("docs: start T-1"));
    assert!(subjects.contains("docs: finish T-1"));
    let session = fs::read_to_string(dir.path().join("session_log.md")).unwrap();
    assert!(session.contains("Agent Agent – T-1 – START"));
    assert!(session.contains("All done, no blockers."));
    assert!(dir.path().join(".runs/T-1/prompt.md").exists());
    assert!(dir.path().join(".runs/T-1/T-1.done").exists());
}

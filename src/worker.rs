use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context;
use clap::Args;
#[allow(unused_imports)]
use log::{debug, info, warn};
use tokio::process::Command;

use crate::util::{utc_now_iso, IoResultExt as _};

pub const DEFAULT_CODEX_CMD: &str = "codex exec --dangerously-bypass-approvals-and-sandbox";

// Filesystem layout of one task's run record under the run root. Ownership
// is split by file, never shared within one: the orchestrator writes
// prompt.md, base_sha.txt and failure.md; the supervisor writes everything
// else.
#[derive(Debug, Clone)]
pub struct RunDir {
    dir: PathBuf,
    task_id: String,
}

impl RunDir {
    pub fn under(run_root: &Path, task_id: &str) -> Self {
        Self {
            dir: run_root.join(task_id),
            task_id: task_id.to_owned(),
        }
    }

    pub fn at(dir: PathBuf, task_id: &str) -> Self {
        Self {
            dir,
            task_id: task_id.to_owned(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prompt_path(&self) -> PathBuf {
        self.dir.join("prompt.md")
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("worker.log")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join("worker.pid")
    }

    pub fn last_message_path(&self) -> PathBuf {
        self.dir.join("last_message.md")
    }

    pub fn base_sha_path(&self) -> PathBuf {
        self.dir.join("base_sha.txt")
    }

    pub fn failure_path(&self) -> PathBuf {
        self.dir.join("failure.md")
    }

    pub fn done_path(&self) -> PathBuf {
        self.dir.join(format!("{}.done", self.task_id))
    }

    pub fn create(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("creating run dir {:?}", self.dir))
    }

    // A sentinel left over from an earlier attempt would make the task look
    // finished the moment it starts.
    pub fn clear_stale_done(&self) -> anyhow::Result<()> {
        fs::remove_file(self.done_path())
            .ignore(io::ErrorKind::NotFound)
            .with_context(|| format!("removing stale sentinel {:?}", self.done_path()))
    }
}

// The DONE sentinel: the one and only machine-readable signal from a worker
// run back to the orchestrator. Line-oriented key=value, parsed leniently;
// classification must never fail just because a worker died while writing,
// so missing keys surface as empty/absent values rather than errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sentinel {
    pub status: String,
    pub task_id: String,
    pub finished_at: String,
    pub log_path: Option<String>,
    pub last_message_path: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl Sentinel {
    pub fn success(&self) -> bool {
        self.status == "success"
    }

    // Status for blocker messages: never empty, even for a garbage file.
    pub fn status_or_unknown(&self) -> &str {
        if self.status.is_empty() {
            "unknown"
        } else {
            &self.status
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut sentinel = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "status" => sentinel.status = value.to_lowercase(),
                "task_id" => sentinel.task_id = value.to_owned(),
                "finished_at" => sentinel.finished_at = value.to_owned(),
                "log_path" => sentinel.log_path = Some(value.to_owned()),
                "last_message_path" => sentinel.last_message_path = Some(value.to_owned()),
                "exit_code" => sentinel.exit_code = value.parse().ok(),
                "error" => sentinel.error = Some(value.to_owned()),
                _ => (),
            }
        }
        sentinel
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("reading sentinel {path:?}"))?;
        Ok(Self::parse(&text))
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("status={}", self.status),
            format!("task_id={}", self.task_id),
            format!("finished_at={}", self.finished_at),
        ];
        if let Some(log_path) = &self.log_path {
            lines.push(format!("log_path={log_path}"));
        }
        if let Some(last_message_path) = &self.last_message_path {
            lines.push(format!("last_message_path={last_message_path}"));
        }
        if let Some(exit_code) = self.exit_code {
            lines.push(format!("exit_code={exit_code}"));
        }
        if let Some(error) = &self.error {
            lines.push(format!("error={error}"));
        }
        lines.join("\n") + "\n"
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        fs::write(path, self.render()).with_context(|| format!("writing sentinel {path:?}"))
    }
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Directory the sub-agent runs in (the task worktree, or the repo root).
    #[arg(long)]
    pub repo_root: PathBuf,
    #[arg(long)]
    pub task_id: String,
    /// Run directory for this task (run root + task id).
    #[arg(long)]
    pub run_dir: PathBuf,
    /// Sub-agent command prefix.
    #[arg(long, default_value = DEFAULT_CODEX_CMD)]
    pub codex_cmd: String,
}

fn quoted(path: &Path) -> String {
    shell_escape::escape(path.to_string_lossy()).into_owned()
}

// Supervise one sub-agent run. Every exit path writes the DONE sentinel;
// that's the whole job. The supervisor never reads or writes the queue, and
// it never interprets the worker's output beyond capturing it.
//
// Returns the supervisor's own exit code: 0 for a successful worker, 1 for
// a failed one, 2 when setup didn't get as far as spawning anything.
pub async fn run(args: &WorkerArgs) -> anyhow::Result<i32> {
    let run_dir = RunDir::at(args.run_dir.clone(), &args.task_id);
    run_dir.create()?;
    run_dir.clear_stale_done()?;

    fs::write(run_dir.pid_path(), format!("{}\n", std::process::id()))
        .with_context(|| format!("writing {:?}", run_dir.pid_path()))?;

    let mut sentinel = Sentinel {
        task_id: args.task_id.clone(),
        ..Sentinel::default()
    };

    if !run_dir.prompt_path().exists() {
        sentinel.status = "failed".to_owned();
        sentinel.finished_at = utc_now_iso();
        sentinel.error = Some("missing_prompt".to_owned());
        sentinel.write(&run_dir.done_path())?;
        return Ok(2);
    }
    if !args.repo_root.exists() {
        sentinel.status = "failed".to_owned();
        sentinel.finished_at = utc_now_iso();
        sentinel.error = Some("missing_repo".to_owned());
        sentinel.write(&run_dir.done_path())?;
        return Ok(2);
    }

    // The sub-agent reads its prompt on stdin and writes its final message
    // to the -o sink. The whole thing goes through a login shell so the
    // user's codex_cmd prefix resolves the way it would interactively.
    let inner = format!(
        "{} -o {} - < {}",
        args.codex_cmd.trim(),
        quoted(&run_dir.last_message_path()),
        quoted(&run_dir.prompt_path()),
    );

    // Prefer a PTY wrapper when the host has one: the sub-agent line-buffers
    // its output when it thinks it's talking to a terminal, which makes
    // worker.log usable for tailing. The two script(1) dialects want their
    // arguments in different shapes.
    let mut cmd = if which::which("script").is_ok() {
        if cfg!(target_os = "linux") {
            let mut cmd = Command::new("script");
            cmd.args(["-q", "-e", "-c"])
                .arg(format!(
                    "bash -lc {}",
                    shell_escape::escape(inner.clone().into())
                ))
                .arg("/dev/null");
            cmd
        } else {
            let mut cmd = Command::new("script");
            cmd.args(["-q", "/dev/null", "bash", "-lc"]).arg(&inner);
            cmd
        }
    } else {
        let mut cmd = Command::new("bash");
        cmd.args(["-lc"]).arg(&inner);
        cmd
    };

    let log_file = fs::File::create(run_dir.log_path())
        .with_context(|| format!("creating {:?}", run_dir.log_path()))?;
    cmd.current_dir(&args.repo_root)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file.try_clone()?))
        .stderr(Stdio::from(log_file));

    info!("worker {}: running {:?}", args.task_id, cmd.as_std());
    match cmd.status().await {
        Ok(status) => match status.code() {
            Some(0) => {
                sentinel.status = "success".to_owned();
                sentinel.exit_code = Some(0);
            }
            Some(code) => {
                sentinel.status = "failed".to_owned();
                sentinel.exit_code = Some(code);
                sentinel.error = Some("nonzero_exit".to_owned());
            }
            None => {
                sentinel.status = "failed".to_owned();
                sentinel.error = Some("killed_by_signal".to_owned());
            }
        },
        Err(e) => {
            sentinel.status = "failed".to_owned();
            sentinel.exit_code = Some(1);
            sentinel.error = Some(format!("spawn:{:?}", e.kind()));
        }
    }

    sentinel.finished_at = utc_now_iso();
    sentinel.log_path = Some(run_dir.log_path().display().to_string());
    sentinel.last_message_path = Some(run_dir.last_message_path().display().to_string());
    sentinel.write(&run_dir.done_path())?;

    Ok(if sentinel.success() { 0 } else { 1 })
}

#[cfg(test)]
pub mod test_utils {
    use std::os::unix::fs::PermissionsExt as _;

    use super::*;

    // A stand-in for the sub-agent command: accepts the `-o <sink> -` calling
    // convention, drains stdin, writes a final message, and runs an arbitrary
    // body script. Gives run-loop tests a worker whose behaviour (commit, no
    // commit, crash) is chosen per task.
    pub fn stub_agent(dir: &Path, name: &str, body: &str, exit_code: i32) -> PathBuf {
        let path = dir.join(name);
        let script = format!(
            "#!/bin/bash\n\
             out=\"\"\n\
             while [ $# -gt 0 ]; do\n\
               case \"$1\" in\n\
                 -o) out=\"$2\"; shift 2;;\n\
                 *) shift;;\n\
               esac\n\
             done\n\
             cat > /dev/null\n\
             {body}\n\
             echo \"Task finished.\" > \"$out\"\n\
             echo \"stub agent ran\"\n\
             exit {exit_code}\n"
        );
        fs::write(&path, script).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }
}

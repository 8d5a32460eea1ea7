use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use futures::channel::mpsc;
use futures::StreamExt as _;
#[allow(unused_imports)]
use log::{debug, info, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::process::{Child, Command};
use tokio::time::sleep;

use crate::git::{branch_for_worktree, CommitHash, Repo, Worktree as _};
use crate::prompt::{self, PromptContext};
use crate::queue::{Queue, QueueStore, Status};
use crate::sched::{admit, ready_set, Caps, Scope};
use crate::session_log::SessionLog;
use crate::util::{tail_lines, utc_now_iso};
use crate::worker::{RunDir, Sentinel};

pub struct Options {
    pub repo_root: PathBuf,
    pub queue_path: PathBuf,
    pub run_root: PathBuf,
    pub caps: Caps,
    pub scope: Scope,
    pub watch_timeout: Duration,
    pub stop_on_blocked: bool,
    pub codex_cmd: String,
    // The binary to re-execute with the hidden `worker` subcommand.
    pub worker_exe: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    // The in-scope ready set drained with no workers left running.
    Drained,
    // --stop-on-blocked tripped.
    StoppedOnBlocked,
}

// Pure scheduling preview for --dry-run: one admission pass, rendered as the
// lines that would be printed, with no git, queue, or filesystem effects.
pub fn dry_run(queue: &Queue, scope: &Scope, caps: &Caps, repo_root: &Path) -> Vec<String> {
    let ready = ready_set(queue, scope);
    let mut active_streams = queue.active_workstreams();
    let planned = admit(&ready, caps, &HashSet::new(), &mut active_streams);
    if planned.is_empty() {
        return vec!["DRY RUN: no runnable tasks (within scope).".to_owned()];
    }
    planned
        .iter()
        .map(|t| {
            let cwd = match t.worktree_subdir() {
                Some(subdir) => repo_root.join(subdir),
                None => repo_root.to_owned(),
            };
            format!(
                "DRY RUN: would spawn {} ({}) in {}",
                t.id,
                t.workstream_id(),
                cwd.display()
            )
        })
        .collect()
}

pub struct Orchestrator {
    repo: Repo,
    store: QueueStore,
    session_log: SessionLog,
    run_root: PathBuf,
    caps: Caps,
    scope: Scope,
    watch_timeout: Duration,
    stop_on_blocked: bool,
    codex_cmd: String,
    worker_exe: PathBuf,
    running: HashMap<String, Child>,
    // Base SHAs recorded at worktree creation, by task id. base_sha.txt in
    // the run dir is the durable copy; this is just the within-run cache.
    base_shas: HashMap<String, CommitHash>,
}

impl Orchestrator {
    pub fn new(opts: Options) -> Self {
        let session_log = SessionLog::new(
            opts.queue_path
                .parent()
                .unwrap_or(Path::new("."))
                .join("session_log.md"),
        );
        Self {
            repo: Repo {
                path: opts.repo_root,
                git_binary: PathBuf::from("git"),
            },
            store: QueueStore::new(opts.queue_path),
            session_log,
            run_root: opts.run_root,
            caps: opts.caps,
            scope: opts.scope,
            watch_timeout: opts.watch_timeout,
            stop_on_blocked: opts.stop_on_blocked,
            codex_cmd: opts.codex_cmd,
            worker_exe: opts.worker_exe,
            running: HashMap::new(),
            base_shas: HashMap::new(),
        }
    }

    // Drive the queue until the in-scope ready set is empty and no workers
    // are running (or --stop-on-blocked trips). Per-task failures become
    // blocker records and the loop keeps going; only queue corruption, git
    // failures on the base branch, and spawn failures abort the run.
    pub async fn run(&mut self) -> anyhow::Result<RunOutcome> {
        let base_branch = self
            .repo
            .current_branch()
            .await
            .context("resolving base branch")?;
        info!("orchestrating on base branch {base_branch:?}");

        // A task that is already in_progress has no supervisor we know
        // about. Respawning it behind the operator's back could double-run
        // work, so refuse and let them repair the queue. This load also
        // gates on queue parse errors before anything gets mutated.
        let queue = self.store.load()?;
        let stuck: Vec<&str> = queue
            .tasks()
            .iter()
            .filter(|t| t.status == Status::InProgress && self.scope.admits(&t.id))
            .map(|t| t.id.as_str())
            .collect();
        if !stuck.is_empty() {
            bail!(
                "task(s) already in_progress with no supervisor: {}; \
                 set them back to pending or blocked, then rerun",
                stuck.join(", ")
            );
        }
        fs::create_dir_all(&self.run_root)
            .with_context(|| format!("creating run root {:?}", self.run_root))?;

        loop {
            if let Some(outcome) = self.tick(&base_branch).await? {
                return Ok(outcome);
            }
        }
    }

    async fn tick(&mut self, base_branch: &str) -> anyhow::Result<Option<RunOutcome>> {
        // The queue is global mutable state shared with the operator's
        // editor; re-read it every tick and only trust this snapshot within
        // the tick.
        let mut queue = self.store.load()?;

        if self.stop_on_blocked {
            let blocked = queue
                .tasks()
                .iter()
                .filter(|t| t.status == Status::Blocked && self.scope.admits(&t.id))
                .count();
            if blocked > 0 {
                info!("STOP: {blocked} blocked task(s)");
                return Ok(Some(RunOutcome::StoppedOnBlocked));
            }
        }

        let ready = ready_set(&queue, &self.scope);
        if ready.is_empty() && self.running.is_empty() {
            info!("DONE: no runnable tasks and no running workers (within scope)");
            return Ok(Some(RunOutcome::Drained));
        }

        let running_ids: HashSet<String> = self.running.keys().cloned().collect();
        let mut active_streams = queue.active_workstreams();
        let admitted: Vec<String> = admit(&ready, &self.caps, &running_ids, &mut active_streams)
            .iter()
            .map(|t| t.id.clone())
            .collect();

        for task_id in &admitted {
            self.start_task(&mut queue, base_branch, task_id).await?;
        }

        if admitted.is_empty() && !self.running.is_empty() && !self.any_sentinel_on_disk() {
            await_run_event(&self.run_root, self.watch_timeout).await?;
        }

        // Decide completion for each running task. The sentinel check must
        // come first: a worker that writes the sentinel and then exits 0
        // is classified by the sentinel, not by the exit we happen to
        // observe afterwards.
        let mut finished: Vec<(String, Option<Sentinel>)> = Vec::new();
        for (task_id, child) in self.running.iter_mut() {
            let run_dir = RunDir::under(&self.run_root, task_id);
            if run_dir.done_path().exists() {
                finished.push((task_id.clone(), Some(Sentinel::read(&run_dir.done_path())?)));
            } else if child
                .try_wait()
                .with_context(|| format!("polling supervisor for {task_id}"))?
                .is_some()
            {
                finished.push((task_id.clone(), None));
            }
        }

        for (task_id, sentinel) in finished {
            let mut child = self
                .running
                .remove(&task_id)
                .expect("finished task not in running map");
            // Reap the supervisor if it has exited; if it is still flushing
            // after writing the sentinel, the runtime reaps it later.
            let _ = child.try_wait();
            match sentinel {
                Some(sentinel) => self.finish_task(base_branch, &task_id, &sentinel).await?,
                None => self.fail_no_sentinel(&task_id).await?,
            }
            self.base_shas.remove(&task_id);
        }

        Ok(None)
    }

    // A sentinel that landed between our spawn pass and now would make the
    // watch sleep on an event that already happened; skip it.
    fn any_sentinel_on_disk(&self) -> bool {
        self.running
            .keys()
            .any(|task_id| RunDir::under(&self.run_root, task_id).done_path().exists())
    }

    async fn start_task(
        &mut self,
        queue: &mut Queue,
        base_branch: &str,
        task_id: &str,
    ) -> anyhow::Result<()> {
        let task = queue
            .task(task_id)
            .with_context(|| format!("task not found: {task_id}"))?
            .clone();
        info!("starting task {task_id} ({})", task.workstream_id());

        let run_dir = RunDir::under(&self.run_root, task_id);
        run_dir.create()?;
        run_dir.clear_stale_done()?;

        // Docs START lands on the base branch before the worktree exists,
        // so the task branch's history includes it. Integration tasks
        // depend on this ordering to stay fast-forwardable.
        queue.update(task_id, |t| {
            t.status = Status::InProgress;
            t.started_at = Some(utc_now_iso());
        })?;
        self.store.save(queue)?;
        self.session_log.append_start(
            task_id,
            task.role_label(),
            base_branch,
            &task.kickoff_prompt,
            task.worktree_subdir(),
        )?;
        self.repo
            .commit_paths(
                [self.store.path(), self.session_log.path()],
                &format!("docs: start {task_id}"),
            )
            .await?;

        let mut worktree_path = None;
        if let Some(subdir) = task.worktree_subdir() {
            let wt = self.repo.ensure_worktree(base_branch, subdir).await?;
            let sha = self
                .repo
                .rev_parse(&wt.branch)
                .await?
                .with_context(|| format!("branch {:?} has no tip after worktree creation", wt.branch))?;
            fs::write(run_dir.base_sha_path(), format!("{sha}\n"))
                .with_context(|| format!("writing {:?}", run_dir.base_sha_path()))?;
            debug!("task {task_id} starts from {} on {}", sha.abbrev(), wt.branch);
            self.base_shas.insert(task_id.to_owned(), sha);
            worktree_path = Some(wt.path);
        }

        let kickoff_text = prompt::load_kickoff_text(&self.repo.path, &task.kickoff_prompt);
        let commands = prompt::required_commands(&kickoff_text);
        if !commands.is_empty() {
            debug!("task {task_id} kickoff requires commands: {commands:?}");
        }
        let prompt_text = prompt::assemble(
            &PromptContext {
                repo_root: &self.repo.path,
                task_id,
                worktree_path: worktree_path.as_deref(),
                base_branch,
                kickoff_ref: &task.kickoff_prompt,
                queue_path: self.store.path(),
                session_log_path: self.session_log.path(),
                run_root: &self.run_root,
            },
            &kickoff_text,
        );
        fs::write(run_dir.prompt_path(), prompt_text)
            .with_context(|| format!("writing {:?}", run_dir.prompt_path()))?;

        // The supervisor runs in the worktree when there is one; rootless
        // tasks run in the repo root without branch isolation.
        let cwd = worktree_path.unwrap_or_else(|| self.repo.path.clone());
        let child = Command::new(&self.worker_exe)
            .arg("worker")
            .arg("--repo-root")
            .arg(&cwd)
            .arg("--task-id")
            .arg(task_id)
            .arg("--run-dir")
            .arg(run_dir.dir())
            .arg("--codex-cmd")
            .arg(&self.codex_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning supervisor for {task_id}"))?;
        self.running.insert(task_id.to_owned(), child);
        Ok(())
    }

    // Classify a finished worker from its sentinel plus the branch-tip
    // check, and record the outcome.
    async fn finish_task(
        &mut self,
        base_branch: &str,
        task_id: &str,
        sentinel: &Sentinel,
    ) -> anyhow::Result<()> {
        let run_dir = RunDir::under(&self.run_root, task_id);

        if !sentinel.success() {
            let status = sentinel.status_or_unknown().to_owned();
            return self
                .block_task(
                    task_id,
                    vec![format!(
                        "Worker status={status} (see {}).",
                        run_dir.dir().display()
                    )],
                    vec![
                        format!("Inspect {}", run_dir.log_path().display()),
                        format!("Inspect {}", run_dir.done_path().display()),
                        "Adjust prompt and rerun.".to_owned(),
                    ],
                    format!("- Orchestrator: marked task blocked (worker status={status})"),
                )
                .await;
        }

        let queue = self.store.load()?;
        let task = queue
            .task(task_id)
            .with_context(|| format!("task not found: {task_id}"))?
            .clone();

        // "success" with no commit on the task branch means the worker
        // silently failed (commits blocked by a sandbox, usually). The
        // branch tip moving is the only proof of work we accept.
        if let Some(subdir) = task.worktree_subdir() {
            let branch = branch_for_worktree(subdir)?;
            let base_sha = match self.base_shas.get(task_id) {
                Some(sha) => sha.clone(),
                None => {
                    let text = fs::read_to_string(run_dir.base_sha_path())
                        .with_context(|| format!("reading {:?}", run_dir.base_sha_path()))?;
                    CommitHash::new(text.trim().to_owned())
                }
            };
            let tip = self.repo.rev_parse(&branch).await?;
            if tip.is_none() || tip == Some(base_sha) {
                return self
                    .block_task(
                        task_id,
                        vec![format!(
                            "No commit produced on branch '{branch}' (likely commit failed)."
                        )],
                        vec![
                            format!("Inspect {}", run_dir.last_message_path().display()),
                            format!("Inspect {}", run_dir.log_path().display()),
                            "Re-run the task with a less restrictive sandbox.".to_owned(),
                        ],
                        "- Orchestrator: marked task blocked (no commit produced)".to_owned(),
                    )
                    .await;
            }
        }

        let mut extra = Vec::new();
        if task.is_integration() {
            if let Some(subdir) = task.worktree_subdir() {
                let branch = branch_for_worktree(subdir)?;
                match self.repo.fast_forward_merge(base_branch, &branch).await {
                    Ok(()) => extra.push(format!(
                        "- Orchestrator: fast-forward merged `{branch}` → `{base_branch}`"
                    )),
                    Err(e) => {
                        return self
                            .block_task(
                                task_id,
                                vec![format!(
                                    "Failed ff-merge {branch} into {base_branch}: {e}"
                                )],
                                vec![
                                    "Inspect git history".to_owned(),
                                    "Resolve merge/rebase, then rerun integration task."
                                        .to_owned(),
                                ],
                                format!(
                                    "- Orchestrator: marked task blocked \
                                     (ff-merge failed: `{branch}` → `{base_branch}`)"
                                ),
                            )
                            .await;
                    }
                }
            }
        }

        info!("task {task_id} completed");
        self.store.update(task_id, |t| {
            t.status = Status::Completed;
            t.completed_at = Some(utc_now_iso());
        })?;
        self.session_log.append_end(
            task_id,
            task.role_label(),
            task.worktree_subdir(),
            &run_dir.last_message_path(),
            &extra,
        )?;
        self.repo
            .commit_paths(
                [self.store.path(), self.session_log.path()],
                &format!("docs: finish {task_id}"),
            )
            .await?;

        // Cleanup strictly after the docs commit; the branch stays behind.
        if let Some(subdir) = task.worktree_subdir() {
            self.repo.remove_worktree(subdir).await;
        }
        Ok(())
    }

    // The supervisor died without the sentinel; preserve a log tail as
    // failure.md since whatever evidence exists is in worker.log.
    async fn fail_no_sentinel(&mut self, task_id: &str) -> anyhow::Result<()> {
        let run_dir = RunDir::under(&self.run_root, task_id);
        let tail = tail_lines(&run_dir.log_path(), 200);
        fs::write(
            run_dir.failure_path(),
            format!(
                "# Worker exited without DONE\n\nfinished_at: {}\n\n\
                 ## Last 200 log lines\n\n```text\n{tail}```\n",
                utc_now_iso()
            ),
        )
        .with_context(|| format!("writing {:?}", run_dir.failure_path()))?;

        self.block_task(
            task_id,
            vec!["Worker exited without writing DONE sentinel.".to_owned()],
            vec![
                format!("Inspect {}", run_dir.log_path().display()),
                format!("Inspect {}", run_dir.failure_path().display()),
                "Re-run task with revised prompt.".to_owned(),
            ],
            "- Orchestrator: marked task blocked (worker exited without DONE sentinel)".to_owned(),
        )
        .await
    }

    // Record a per-task blocker: queue fields, session log END, docs
    // commit. The worktree is preserved for post-mortem inspection.
    async fn block_task(
        &mut self,
        task_id: &str,
        blockers: Vec<String>,
        unblock_steps: Vec<String>,
        extra: String,
    ) -> anyhow::Result<()> {
        warn!("task {task_id} blocked: {blockers:?}");
        let queue = self.store.update(task_id, |t| {
            t.status = Status::Blocked;
            t.blocked_at = Some(utc_now_iso());
            t.blockers = Some(blockers);
            t.unblock_steps = Some(unblock_steps);
        })?;
        let task = queue
            .task(task_id)
            .with_context(|| format!("task not found: {task_id}"))?;
        let run_dir = RunDir::under(&self.run_root, task_id);
        self.session_log.append_end(
            task_id,
            task.role_label(),
            task.worktree_subdir(),
            &run_dir.last_message_path(),
            &[extra],
        )?;
        self.repo
            .commit_paths(
                [self.store.path(), self.session_log.path()],
                &format!("docs: finish {task_id} (blocked)"),
            )
            .await?;
        Ok(())
    }
}

// Block until anything changes under the run root (sentinels landing, logs
// growing), or the timeout expires. The timeout is a liveness fallback, not
// a schedule; spurious wakeups are fine because the tick re-reads the world
// anyway.
async fn await_run_event(dir: &Path, timeout: Duration) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            // A send failure just means the receiver is gone because the
            // wait already finished; nothing useful to do about it.
            let _ = tx.unbounded_send(res);
        },
        notify::Config::default(),
    )
    .context("creating run-root watcher")?;
    watcher
        .watch(dir, RecursiveMode::Recursive)
        .context("watching run root")?;
    tokio::select! {
        event = rx.next() => debug!("run root event: {event:?}"),
        () = sleep(timeout) => debug!("run-root watch timed out"),
    }
    Ok(())
}

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
#[allow(unused_imports)]
use log::{debug, error, info};

mod git;
mod process;
mod prompt;
mod queue;
mod run_loop;
mod sched;
mod session_log;
mod util;
mod worker;

use run_loop::{dry_run, Options, Orchestrator, RunOutcome};
use sched::{Caps, Scope};

// 0: clean drain or dry run. 1: stop-on-blocked trip or a fatal error.
// 2: invocation errors (clap uses the same code for bad flags).
const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Repository root (the main checkout; HEAD must be on a local branch).
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,
    /// Path to the task queue JSON.
    #[arg(long)]
    queue: Option<PathBuf>,
    /// Repo-relative run state root.
    #[arg(long, default_value = ".runs")]
    run_root: PathBuf,
    /// Global max parallel workers.
    #[arg(long, default_value_t = 2)]
    max_workers: usize,
    /// Max concurrent tasks per workstream; 0 disables the per-stream gate.
    #[arg(long, default_value_t = 1)]
    per_workstream: usize,
    /// Fallback wait window for the run-root watch, in seconds.
    #[arg(long, default_value_t = 600)]
    watch_timeout_s: u64,
    /// Exit with failure as soon as any in-scope task is blocked.
    #[arg(long)]
    stop_on_blocked: bool,
    /// Print one tick's worth of would-be spawns and exit without mutating
    /// the queue, the repo, or the run root.
    #[arg(long)]
    dry_run: bool,
    /// Comma-separated allowlist of task IDs to run.
    #[arg(long, default_value = "")]
    only_task_ids: String,
    /// Regex allowlist for task IDs (applied after --only-task-ids).
    #[arg(long, default_value = "")]
    id_regex: String,
    /// Sub-agent command prefix.
    #[arg(long, default_value = worker::DEFAULT_CODEX_CMD)]
    codex_cmd: String,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise a single sub-agent run and report via the DONE sentinel.
    /// Spawned by the orchestrator; not part of the user-facing surface.
    #[command(hide = true)]
    Worker(worker::WorkerArgs),
}

async fn do_main(args: Args) -> anyhow::Result<ExitCode> {
    if let Some(Command::Worker(worker_args)) = &args.command {
        let code = worker::run(worker_args).await?;
        return Ok(ExitCode::from(code as u8));
    }

    let Some(queue_path) = args.queue.clone() else {
        eprintln!("--queue is required");
        return Ok(ExitCode::from(EXIT_USAGE));
    };
    let scope = match Scope::new(&args.only_task_ids, &args.id_regex) {
        Ok(scope) => scope,
        Err(e) => {
            eprintln!("{e:#}");
            return Ok(ExitCode::from(EXIT_USAGE));
        }
    };
    let repo_root = args
        .repo_root
        .canonicalize()
        .with_context(|| format!("resolving repo root {:?}", args.repo_root))?;
    let queue_path = queue_path
        .canonicalize()
        .with_context(|| format!("resolving queue path {:?}", queue_path))?;
    let run_root = repo_root.join(&args.run_root);
    let caps = Caps {
        max_workers: args.max_workers,
        per_workstream: args.per_workstream,
    };

    if args.dry_run {
        let store = queue::QueueStore::new(queue_path);
        let queue = store.load()?;
        for line in dry_run(&queue, &scope, &caps, &repo_root) {
            println!("{line}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    // The supervisor is this same binary re-executed with the hidden
    // `worker` subcommand, so not knowing our own path means no workers can
    // ever be spawned.
    let worker_exe = match env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("cannot resolve the worker spawn helper (current executable): {e}");
            return Ok(ExitCode::from(EXIT_USAGE));
        }
    };

    let mut orchestrator = Orchestrator::new(Options {
        repo_root,
        queue_path,
        run_root,
        caps,
        scope,
        watch_timeout: Duration::from_secs(args.watch_timeout_s),
        stop_on_blocked: args.stop_on_blocked,
        codex_cmd: args.codex_cmd.clone(),
        worker_exe,
    });
    match orchestrator.run().await? {
        RunOutcome::Drained => {
            println!("DONE: no runnable tasks and no running workers (within scope).");
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::StoppedOnBlocked => {
            println!("STOP: blocked task(s) in scope.");
            Ok(ExitCode::from(EXIT_FAILURE))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    // Logging is best-effort; a bad RUST_LOG spec shouldn't take down the
    // orchestrator.
    let _logger = flexi_logger::Logger::try_with_env_or_str("info")
        .and_then(|logger| logger.start())
        .ok();
    match do_main(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

use std::fs;
use std::path::Path;

use indoc::formatdoc;
use lazy_static::lazy_static;
#[allow(unused_imports)]
use log::debug;
use regex::Regex;

lazy_static! {
    static ref BULLET_REGEX: Regex = Regex::new(r"^-\s+(.*)$").unwrap();
}

// A kickoff reference is a path if it looks like one; everything else is
// inline prompt text. Leading '#' disambiguates markdown headings, which
// otherwise tend to contain slashes.
pub fn looks_like_path(s: &str) -> bool {
    let s = s.trim();
    (s.contains('/') || s.ends_with(".md") || s.ends_with(".txt")) && !s.starts_with('#')
}

// Resolve a kickoff reference to prompt text. Path resolution is
// repo-relative; a path that doesn't exist falls through to inline-text
// interpretation, which keeps a typo'd path observable in the prompt instead
// of aborting the run.
pub fn load_kickoff_text(repo_root: &Path, kickoff_ref: &str) -> String {
    let kickoff_ref = kickoff_ref.trim();
    if kickoff_ref.is_empty() {
        return String::new();
    }
    if looks_like_path(kickoff_ref) {
        let path = repo_root.join(kickoff_ref);
        if let Ok(text) = fs::read_to_string(&path) {
            return text;
        }
        debug!("kickoff ref {kickoff_ref:?} looks like a path but isn't readable, using it as inline text");
    }
    kickoff_ref.to_owned()
}

// Best-effort discovery of the "## Commands (required)" section of a kickoff
// prompt. Bullets may be wrapped in single backticks. The orchestrator never
// executes these (the sub-agent does); they only get surfaced for logging,
// and an absent section is not an error.
pub fn required_commands(kickoff_prompt: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut in_section = false;
    for raw in kickoff_prompt.lines() {
        let line = raw.trim();
        if !in_section {
            let lower = line.to_lowercase();
            if lower == "## commands (required)" || lower == "commands (required)" {
                in_section = true;
            }
            continue;
        }
        if line.starts_with("## ") {
            break;
        }
        let Some(captures) = BULLET_REGEX.captures(line) else {
            continue;
        };
        let mut item = captures.get(1).unwrap().as_str().trim();
        if item.len() >= 2 && item.starts_with('`') && item.ends_with('`') {
            item = &item[1..item.len() - 1];
        }
        if !item.is_empty() {
            commands.push(item.to_owned());
        }
    }
    commands
}

pub struct PromptContext<'a> {
    pub repo_root: &'a Path,
    pub task_id: &'a str,
    pub worktree_path: Option<&'a Path>,
    pub base_branch: &'a str,
    pub kickoff_ref: &'a str,
    pub queue_path: &'a Path,
    pub session_log_path: &'a Path,
    pub run_root: &'a Path,
}

// The full worker prompt: a fixed hard-rules preamble, then the kickoff body
// verbatim. The preamble is the contract that keeps workers inside their
// worktree and out of the orchestrator's files; it changes rarely and on
// purpose.
pub fn assemble(ctx: &PromptContext, kickoff_text: &str) -> String {
    let cwd = ctx.worktree_path.unwrap_or(ctx.repo_root);
    formatdoc! {"
        You are a coding agent executing exactly one task: {task_id}.
        Base repo: {repo_root}
        Task worktree: {cwd}
        Base branch: {base_branch}

        Hard rules:
        - Do not proceed to any other task IDs.
        - Do NOT edit task tracking or session logs:
          - {queue_path}
          - {session_log_path}
        - Do NOT touch the orchestrator's run artifacts under {run_root}.
        - Do NOT create/remove git worktrees; the orchestrator handles that.
        - Do NOT update task statuses; the orchestrator handles that.
        - Do NOT run `git checkout` / `git pull` or otherwise switch branches; the orchestrator already prepared the worktree on the task branch.
        - Work only in the provided worktree (git repo cwd).
        - Run the required commands listed under 'Commands (required)' in the kickoff prompt.
        - End with a concise report including: files changed, branch/worktree, commits, commands run + pass/fail, and any blockers.

        Kickoff prompt path: {kickoff_ref}

        Kickoff prompt (verbatim):
        {kickoff}
        ",
        task_id = ctx.task_id,
        repo_root = ctx.repo_root.display(),
        cwd = cwd.display(),
        base_branch = ctx.base_branch,
        queue_path = ctx.queue_path.display(),
        session_log_path = ctx.session_log_path.display(),
        run_root = ctx.run_root.display(),
        kickoff_ref = ctx.kickoff_ref,
        kickoff = kickoff_text.trim(),
    }
}

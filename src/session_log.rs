use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use lazy_static::lazy_static;
#[allow(unused_imports)]
use log::debug;
use regex::Regex;

use crate::util::utc_now_minute;

const SNIPPET_MAX_LINES: usize = 40;

lazy_static! {
    // Workers report blockers as a markdown bullet like
    // "- **Blockers**: waiting on schema review". Extraction is best-effort:
    // the final report format is a convention, not a contract, so anything
    // unmatched just collapses to "none".
    static ref BLOCKER_REGEX: Regex = Regex::new(r"(?im)^-\s*\*\*Blockers?\*\*:\s*(.*)$").unwrap();
}

// Appends human-readable START/END entries next to the queue file. Entries
// are markdown H2 sections; nothing ever rewrites or deletes an earlier
// section.
#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, text: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating session log dir {parent:?}"))?;
        }
        let mut existing = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("reading session log {:?}", self.path)),
        };
        if !existing.is_empty() && !existing.ends_with('\n') {
            existing.push('\n');
        }
        existing.push_str(text);
        fs::write(&self.path, existing)
            .with_context(|| format!("writing session log {:?}", self.path))
    }

    pub fn append_start(
        &self,
        task_id: &str,
        role: &str,
        base_branch: &str,
        kickoff_ref: &str,
        worktree: Option<&str>,
    ) -> anyhow::Result<()> {
        let ts = utc_now_minute();
        let worktree_line = match worktree {
            Some(wt) => format!("- Worktree: `{wt}`"),
            None => "- Worktree: N/A".to_owned(),
        };
        let entry = format!(
            "## [{ts}] {role} Agent – {task_id} – START\n\
             - Orchestrator: set `{task_id}` → `in_progress`\n\
             - Base branch: `{base_branch}`\n\
             - Kickoff prompt: `{kickoff_ref}`\n\
             {worktree_line}\n\
             - Blockers: none\n\n"
        );
        self.append(&entry)
    }

    pub fn append_end(
        &self,
        task_id: &str,
        role: &str,
        worktree: Option<&str>,
        last_message_path: &Path,
        extra: &[String],
    ) -> anyhow::Result<()> {
        let ts = utc_now_minute();
        let last_message = fs::read_to_string(last_message_path).unwrap_or_default();

        let mut lines = vec![
            format!("## [{ts}] {role} Agent – {task_id} – END"),
            match worktree {
                Some(wt) => format!("- Worktree: `{wt}`"),
                None => "- Worktree: N/A".to_owned(),
            },
            format!("- Worker output: `{}`", last_message_path.display()),
        ];
        lines.extend(extra.iter().cloned());

        let snippet = snippet(&last_message);
        if !snippet.is_empty() {
            lines.push(format!(
                "- Worker summary (first ~{SNIPPET_MAX_LINES} lines):"
            ));
            lines.push("```text".to_owned());
            lines.push(snippet);
            lines.push("```".to_owned());
        }
        lines.push(blocker_line(&last_message));
        lines.push(String::new());
        self.append(&(lines.join("\n") + "\n"))
    }
}

fn snippet(message: &str) -> String {
    message
        .trim()
        .lines()
        .take(SNIPPET_MAX_LINES)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_owned()
}

fn blocker_line(message: &str) -> String {
    if let Some(captures) = BLOCKER_REGEX.captures(message) {
        let tail = captures.get(1).unwrap().as_str().trim();
        if !tail.is_empty() && !["none", "<none>"].contains(&tail.to_lowercase().as_str()) {
            return format!("- Blockers: {tail}");
        }
    }
    "- Blockers: none".to_owned()
}

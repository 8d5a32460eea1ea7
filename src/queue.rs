use std::collections::HashSet;
use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
#[allow(unused_imports)]
use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

// Task status. Input synonyms normalize on read; anything unrecognized is
// carried through verbatim so a hand-edited queue never gets corrupted, but
// such tasks are never runnable and never count as completed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
    Deferred,
    Other(String),
}

impl Status {
    pub fn normalize(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "" | "todo" | "pending" => Self::Pending,
            "in_progress" | "in-progress" => Self::InProgress,
            "done" | "completed" | "complete" => Self::Completed,
            "blocked" => Self::Blocked,
            "deferred" => Self::Deferred,
            _ => Self::Other(s.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Deferred => "deferred",
            Self::Other(s) => s,
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::normalize(&s))
    }
}

// A task record as stored in the queue file. Field names are load-bearing
// (they're the wire contract with whoever authored the queue); unknown
// fields ride along in `extra` and survive a save.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kickoff_prompt: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub task_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worktree: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workstream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unblock_steps: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    // Scheduling order; tasks without an explicit order slot in at
    // (index + 1) * 10 like lines in a BASIC program.
    pub fn effective_order(&self, index: usize) -> i64 {
        self.order.unwrap_or(((index as i64) + 1) * 10)
    }

    // Explicit workstream wins; otherwise the task type implies one.
    pub fn workstream_id(&self) -> String {
        if let Some(ws) = &self.workstream_id {
            let ws = ws.trim();
            if !ws.is_empty() {
                return ws.to_owned();
            }
        }
        match self.task_type.trim().to_lowercase().as_str() {
            "code" => "WS-CODE".to_owned(),
            "test" => "WS-TEST".to_owned(),
            "integration" => "WS-INT".to_owned(),
            _ => "WS-DEFAULT".to_owned(),
        }
    }

    // Role label used in session log headers.
    pub fn role_label(&self) -> &'static str {
        match self.task_type.trim().to_lowercase().as_str() {
            "code" => "Code",
            "test" => "Test",
            "integration" => "Integration",
            _ => "Agent",
        }
    }

    pub fn is_integration(&self) -> bool {
        self.task_type.trim().eq_ignore_ascii_case("integration")
    }

    // The worktree subdirectory, unless the task opted out of branch
    // isolation with an empty value or the N/A sentinel.
    pub fn worktree_subdir(&self) -> Option<&str> {
        let wt = self.worktree.trim();
        if wt.is_empty() || wt.eq_ignore_ascii_case("n/a") {
            None
        } else {
            Some(wt)
        }
    }
}

// The queue file is either a bare array of tasks or an object with a `tasks`
// array; whichever shape came in goes back out.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
enum QueueFile {
    Wrapped {
        tasks: Vec<Task>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Bare(Vec<Task>),
}

#[derive(Debug, Clone)]
pub struct Queue {
    file: QueueFile,
}

impl Queue {
    pub fn tasks(&self) -> &[Task] {
        match &self.file {
            QueueFile::Wrapped { tasks, .. } => tasks,
            QueueFile::Bare(tasks) => tasks,
        }
    }

    fn tasks_mut(&mut self) -> &mut Vec<Task> {
        match &mut self.file {
            QueueFile::Wrapped { tasks, .. } => tasks,
            QueueFile::Bare(tasks) => tasks,
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks().iter().find(|t| t.id == id)
    }

    // Apply a patch to the task with the given id. A missing id is a
    // programmer error (the id came out of this same queue earlier in the
    // tick), so it's a hard failure rather than a per-task blocker.
    pub fn update(&mut self, id: &str, patch: impl FnOnce(&mut Task)) -> anyhow::Result<()> {
        let task = self
            .tasks_mut()
            .iter_mut()
            .find(|t| t.id == id)
            .with_context(|| format!("task not found: {id}"))?;
        patch(task);
        Ok(())
    }

    // Ids of completed tasks across the whole queue, unfiltered. Dependency
    // satisfaction is always judged against the full queue, not the scoped
    // subset the current run is allowed to spawn from.
    pub fn completed_ids(&self) -> HashSet<&str> {
        self.tasks()
            .iter()
            .filter(|t| t.status == Status::Completed)
            .map(|t| t.id.as_str())
            .collect()
    }

    // Workstreams with an in_progress task anywhere in the queue.
    pub fn active_workstreams(&self) -> HashSet<String> {
        self.tasks()
            .iter()
            .filter(|t| t.status == Status::InProgress)
            .map(|t| t.workstream_id())
            .collect()
    }
}

// Reads and rewrites the queue file. Not multi-writer safe; exactly one
// orchestrator owns a queue at a time.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<Queue> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading queue file {:?}", self.path))?;
        let file: QueueFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing queue file {:?}", self.path))?;
        let queue = Queue { file };
        for task in queue.tasks() {
            if task.id.trim().is_empty() {
                warn!("queue {:?} contains a task with no id, ignoring it", self.path);
            }
        }
        Ok(queue)
    }

    // Whole-file rewrite, two-space indented with a trailing newline.
    // Atomicity against a crash mid-write is deliberately not provided; see
    // the sole-writer assumption above.
    pub fn save(&self, queue: &Queue) -> anyhow::Result<()> {
        let mut text = serde_json::to_string_pretty(&queue.file)
            .context("serializing queue")?;
        text.push('\n');
        fs::write(&self.path, text).with_context(|| format!("writing queue file {:?}", self.path))
    }

    // Load-patch-save in one step, for transitions driven by a single field
    // change. Returns the queue as saved.
    pub fn update(&self, id: &str, patch: impl FnOnce(&mut Task)) -> anyhow::Result<Queue> {
        let mut queue = self.load()?;
        queue.update(id, patch)?;
        self.save(&queue)?;
        Ok(queue)
    }
}

// Tasks lacking an id can't be scheduled, addressed, or reported on; they
// stay in the file but are invisible to the orchestrator.
pub fn schedulable(tasks: &[Task]) -> impl Iterator<Item = (usize, &Task)> {
    tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.id.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn store_with(dir: &tempfile::TempDir, content: &str) -> QueueStore {
        let path = dir.path().join("tasks.json");
        fs::write(&path, content).unwrap();
        QueueStore::new(path)
    }

    #[test_case("todo", Status::Pending; "todo")]
    #[test_case("pending", Status::Pending; "pending")]
    #[test_case("", Status::Pending; "empty")]
    #[test_case("In-Progress", Status::InProgress; "dashed")]
    #[test_case("done", Status::Completed; "done")]
    #[test_case("complete", Status::Completed; "complete")]
    #[test_case("BLOCKED", Status::Blocked; "shouting")]
    #[test_case("deferred", Status::Deferred; "deferred")]
    #[test_case("weird", Status::Other("weird".into()); "unknown kept")]
    fn test_normalize_status(input: &str, want: Status) {
        assert_eq!(Status::normalize(input), want);
        // Normalizing is idempotent.
        assert_eq!(Status::normalize(Status::normalize(input).as_str()), want);
    }

    #[test]
    fn test_load_bare_array_and_wrapped_object() {
        let dir = tempfile::TempDir::new().unwrap();
        let bare = store_with(&dir, r#"[{"id": "A", "status": "todo"}]"#);
        let queue = bare.load().unwrap();
        assert_eq!(queue.tasks().len(), 1);
        assert_eq!(queue.tasks()[0].status, Status::Pending);

        let wrapped = store_with(
            &dir,
            r#"{"tasks": [{"id": "A"}, {"id": "B"}], "schema": 1}"#,
        );
        let queue = wrapped.load().unwrap();
        assert_eq!(queue.tasks().len(), 2);
        // The wrapper object's own fields survive a save.
        wrapped.save(&queue).unwrap();
        let text = fs::read_to_string(wrapped.path()).unwrap();
        assert!(text.contains("\"schema\": 1"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_round_trip_preserves_unknown_task_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_with(
            &dir,
            r#"[{"id": "A", "status": "pending", "owner": "dana", "estimate_h": 3}]"#,
        );
        let queue = store.load().unwrap();
        store.save(&queue).unwrap();
        let reloaded = store.load().unwrap();
        assert_eq!(
            reloaded.tasks()[0].extra.get("owner"),
            Some(&Value::String("dana".into()))
        );
        assert_eq!(
            reloaded.tasks()[0].extra.get("estimate_h"),
            Some(&Value::from(3))
        );
        // save(load(q)) is stable from here on.
        let first = fs::read_to_string(store.path()).unwrap();
        store.save(&store.load().unwrap()).unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), first);
    }

    #[test]
    fn test_update_missing_task_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_with(&dir, r#"[{"id": "A"}]"#);
        assert!(store.update("nope", |t| t.status = Status::Blocked).is_err());
        let queue = store
            .update("A", |t| {
                t.status = Status::InProgress;
                t.started_at = Some("2025-01-01T00:00:00Z".into());
            })
            .unwrap();
        assert_eq!(queue.task("A").unwrap().status, Status::InProgress);
    }

    #[test]
    fn test_effective_order_defaults() {
        let task = Task {
            id: "A".into(),
            ..Task::default()
        };
        assert_eq!(task.effective_order(0), 10);
        assert_eq!(task.effective_order(4), 50);
        let task = Task {
            id: "B".into(),
            order: Some(7),
            ..Task::default()
        };
        assert_eq!(task.effective_order(4), 7);
    }

    #[test_case("", None; "empty")]
    #[test_case("N/A", None; "sentinel")]
    #[test_case("n/a", None; "sentinel lowercase")]
    #[test_case("work/A", Some("work/A"); "real path")]
    fn test_worktree_subdir(input: &str, want: Option<&str>) {
        let task = Task {
            id: "A".into(),
            worktree: input.into(),
            ..Task::default()
        };
        assert_eq!(task.worktree_subdir(), want);
    }

    #[test]
    fn test_workstream_derivation() {
        let mk = |typ: &str, ws: Option<&str>| Task {
            id: "X".into(),
            task_type: typ.into(),
            workstream_id: ws.map(|s| s.to_owned()),
            ..Task::default()
        };
        assert_eq!(mk("code", None).workstream_id(), "WS-CODE");
        assert_eq!(mk("test", None).workstream_id(), "WS-TEST");
        assert_eq!(mk("integration", None).workstream_id(), "WS-INT");
        assert_eq!(mk("docs", None).workstream_id(), "WS-DEFAULT");
        assert_eq!(mk("code", Some("WS-CUSTOM")).workstream_id(), "WS-CUSTOM");
        assert_eq!(mk("code", Some("  ")).workstream_id(), "WS-CODE");
    }

    #[test]
    fn test_role_labels() {
        let mk = |typ: &str| Task {
            id: "X".into(),
            task_type: typ.into(),
            ..Task::default()
        };
        assert_eq!(mk("code").role_label(), "Code");
        assert_eq!(mk("Integration").role_label(), "Integration");
        assert_eq!(mk("").role_label(), "Agent");
    }
}

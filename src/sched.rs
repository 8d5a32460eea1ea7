use std::collections::HashSet;

use anyhow::Context;
use itertools::Itertools as _;
#[allow(unused_imports)]
use log::debug;
use regex::Regex;

use crate::queue::{schedulable, Queue, Status, Task};

// Restricts which tasks this run is allowed to operate on. Both filters must
// pass; an empty id set means no id filter.
#[derive(Debug, Default)]
pub struct Scope {
    pub only_ids: HashSet<String>,
    pub id_regex: Option<Regex>,
}

impl Scope {
    pub fn new(only_task_ids: &str, id_regex: &str) -> anyhow::Result<Self> {
        let only_ids = only_task_ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        let id_regex = if id_regex.is_empty() {
            None
        } else {
            Some(Regex::new(id_regex).context("compiling --id-regex")?)
        };
        Ok(Self { only_ids, id_regex })
    }

    pub fn admits(&self, id: &str) -> bool {
        if !self.only_ids.is_empty() && !self.only_ids.contains(id) {
            return false;
        }
        match &self.id_regex {
            Some(re) => re.is_match(id),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Caps {
    pub max_workers: usize,
    // 0 disables the per-workstream gate entirely.
    pub per_workstream: usize,
}

// Tasks that could run right now, scope-filtered, sorted by ascending order
// with queue position breaking ties. Dependency satisfaction is judged
// against the completed set of the whole queue, so an out-of-scope
// dependency that already finished still unblocks its dependents.
//
// This is a pure function of the queue snapshot and the scope; the event
// loop leans on that for its termination condition.
pub fn ready_set<'a>(queue: &'a Queue, scope: &Scope) -> Vec<&'a Task> {
    let done = queue.completed_ids();
    schedulable(queue.tasks())
        .filter(|(_, t)| scope.admits(&t.id))
        .filter(|(_, t)| t.status == Status::Pending)
        .filter(|(_, t)| t.depends_on.iter().all(|dep| done.contains(dep.as_str())))
        .sorted_by_key(|(idx, t)| (t.effective_order(*idx), *idx))
        .map(|(_, t)| t)
        .collect()
}

// Greedy admission under the global and per-workstream caps. `running` is
// the set of task ids with a live supervisor; `active_streams` is mutated as
// tasks are admitted so that two same-stream tasks never get picked in one
// pass.
pub fn admit<'a>(
    ready: &[&'a Task],
    caps: &Caps,
    running: &HashSet<String>,
    active_streams: &mut HashSet<String>,
) -> Vec<&'a Task> {
    let mut admitted = Vec::new();
    for task in ready {
        if running.contains(&task.id) {
            continue;
        }
        if running.len() + admitted.len() >= caps.max_workers {
            break;
        }
        let ws = task.workstream_id();
        if caps.per_workstream > 0 && active_streams.contains(&ws) {
            continue;
        }
        active_streams.insert(ws);
        admitted.push(*task);
    }
    admitted
}

use crate::types::TaskSpec;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;
use weft_core::WeftResult;

/// A submitted task waiting in (or travelling through) the queue.
pub(crate) struct QueuedTask {
    pub(crate) spec: TaskSpec,
    /// Submission order. Survives retries, so a retried task keeps its place
    /// within its priority band.
    pub(crate) seq: u64,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) retry_count: u32,
    pub(crate) reply: Option<oneshot::Sender<WeftResult<Value>>>,
}

impl QueuedTask {
    pub(crate) fn id(&self) -> &str {
        &self.spec.id
    }

    /// All dependencies are in the completed set.
    pub(crate) fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.spec.dependencies.iter().all(|d| completed.contains(d))
    }

    /// Resolve the submitter's handle. Later calls are no-ops.
    pub(crate) fn resolve(&mut self, result: WeftResult<Value>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// Pending tasks ordered by priority descending, then submission order.
#[derive(Default)]
pub(crate) struct TaskQueue {
    pending: Vec<QueuedTask>,
    next_seq: u64,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wrap a fresh submission, stamping it with the next sequence number.
    pub(crate) fn admit(
        &mut self,
        spec: TaskSpec,
        reply: oneshot::Sender<WeftResult<Value>>,
    ) -> QueuedTask {
        let seq = self.next_seq;
        self.next_seq += 1;
        QueuedTask {
            spec,
            seq,
            enqueued_at: Utc::now(),
            retry_count: 0,
            reply: Some(reply),
        }
    }

    /// Insert keeping the queue ordered.
    pub(crate) fn push(&mut self, task: QueuedTask) {
        let key = (std::cmp::Reverse(task.spec.priority), task.seq);
        let at = self
            .pending
            .partition_point(|t| (std::cmp::Reverse(t.spec.priority), t.seq) < key);
        self.pending.insert(at, task);
    }

    /// Remove and return the first ready task in queue order.
    pub(crate) fn take_next_ready(&mut self, completed: &HashSet<String>) -> Option<QueuedTask> {
        let at = self.pending.iter().position(|t| t.is_ready(completed))?;
        Some(self.pending.remove(at))
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.pending.iter().any(|t| t.id() == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Remove every pending task that depends on `failed`, directly or
    /// through another removed task.
    pub(crate) fn remove_dependents_of(&mut self, failed: &str) -> Vec<QueuedTask> {
        let mut doomed: HashSet<String> = HashSet::from([failed.to_string()]);
        let mut removed = Vec::new();
        loop {
            let before = removed.len();
            let mut i = 0;
            while i < self.pending.len() {
                if self.pending[i]
                    .spec
                    .dependencies
                    .iter()
                    .any(|d| doomed.contains(d))
                {
                    let task = self.pending.remove(i);
                    doomed.insert(task.id().to_string());
                    removed.push(task);
                } else {
                    i += 1;
                }
            }
            if removed.len() == before {
                return removed;
            }
        }
    }

    /// Ids of pending tasks in queue order.
    pub(crate) fn ids(&self) -> Vec<String> {
        self.pending.iter().map(|t| t.id().to_string()).collect()
    }

    /// Dependency graph of the pending tasks.
    pub(crate) fn graph(&self) -> HashMap<String, Vec<String>> {
        self.pending
            .iter()
            .map(|t| (t.id().to_string(), t.spec.dependencies.clone()))
            .collect()
    }

    pub(crate) fn has_cycle(&self) -> bool {
        has_cycle(&self.graph())
    }
}

/// Check a dependency graph for cycles. Edges to ids outside the graph are
/// ignored.
pub fn has_cycle(graph: &HashMap<String, Vec<String>>) -> bool {
    let mut visited = HashMap::new();
    for id in graph.keys() {
        if dfs_cycle(graph, id, &mut visited) {
            return true;
        }
    }
    false
}

fn dfs_cycle<'a>(
    graph: &'a HashMap<String, Vec<String>>,
    id: &'a str,
    visited: &mut HashMap<&'a str, u8>,
) -> bool {
    match visited.get(id) {
        Some(1) => return true,  // back edge
        Some(2) => return false, // already processed
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(deps) = graph.get(id) {
        for dep in deps {
            if dfs_cycle(graph, dep, visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2);
    false
}

use std::sync::Mutex;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, TaskError};
use crate::runtime::task::{TaskBody, TaskId, TaskRecord, TaskStatus, Validator};

/// Per-task runtime state that is never serialized.
pub(crate) struct TaskRuntime {
    pub body: Mutex<Option<TaskBody>>,
    pub validator: Mutex<Option<Validator>>,
    pub token: CancellationToken,
    pub status_tx: watch::Sender<TaskStatus>,
}

/// 任务仓库 (arena)
///
/// Tasks are addressed by id; parent/child relations are ids resolved here,
/// so a task tree has no owning cycles and a record is just data.
#[derive(Default)]
pub struct TaskStore {
    records: DashMap<TaskId, TaskRecord>,
    runtime: DashMap<TaskId, std::sync::Arc<TaskRuntime>>,
    tag_index: DashMap<String, DashSet<TaskId>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, record: TaskRecord, runtime: TaskRuntime) {
        for tag in &record.tags {
            self.tag_index.entry(tag.clone()).or_default().insert(record.id);
        }
        let id = record.id;
        self.runtime.insert(id, std::sync::Arc::new(runtime));
        self.records.insert(id, record);
    }

    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.records.get(&id).map(|r| r.status)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn runtime(&self, id: TaskId) -> Option<std::sync::Arc<TaskRuntime>> {
        self.runtime.get(&id).map(|r| r.value().clone())
    }

    pub(crate) fn token(&self, id: TaskId) -> Option<CancellationToken> {
        self.runtime.get(&id).map(|r| r.token.clone())
    }

    pub(crate) fn subscribe(&self, id: TaskId) -> Option<watch::Receiver<TaskStatus>> {
        self.runtime.get(&id).map(|r| r.status_tx.subscribe())
    }

    pub(crate) fn add_child(&self, parent: TaskId, child: TaskId) {
        if let Some(mut r) = self.records.get_mut(&parent) {
            r.children.push(child);
        }
    }

    pub fn add_tag(&self, id: TaskId, tag: impl Into<String>) {
        let tag = tag.into();
        if let Some(mut r) = self.records.get_mut(&id) {
            r.tags.insert(tag.clone());
            self.tag_index.entry(tag).or_default().insert(id);
        }
    }

    /// Applies a forward status transition, stamping times and notifying
    /// waiters. Backward or post-terminal transitions are rejected.
    pub(crate) fn transition(
        &self,
        id: TaskId,
        next: TaskStatus,
        result: Option<Value>,
        error: Option<TaskError>,
    ) -> Result<()> {
        {
            let mut record = self
                .records
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("Task", id.to_string()))?;
            if !record.status.can_transition_to(next) {
                return Err(EngineError::IllegalState(format!(
                    "Task {} cannot move from {} to {}",
                    id, record.status, next
                )));
            }
            let now = Utc::now();
            match next {
                TaskStatus::Queued => record.submitted_at = Some(now),
                TaskStatus::InProgress => record.started_at = Some(now),
                _ => record.ended_at = Some(now),
            }
            record.status = next;
            if result.is_some() {
                record.result = result;
            }
            if error.is_some() {
                record.error = error;
            }
        }
        if let Some(rt) = self.runtime.get(&id) {
            rt.status_tx.send_replace(next);
        }
        Ok(())
    }

    pub fn children_of(&self, id: TaskId) -> Vec<TaskId> {
        self.records
            .get(&id)
            .map(|r| r.children.clone())
            .unwrap_or_default()
    }

    pub fn tasks_with_tag(&self, tag: &str) -> Vec<TaskRecord> {
        let ids: Vec<TaskId> = match self.tag_index.get(tag) {
            Some(set) => set.iter().map(|id| *id).collect(),
            None => return Vec::new(),
        };
        let mut out: Vec<TaskRecord> = ids.into_iter().filter_map(|id| self.get(id)).collect();
        out.sort_by_key(|r| r.submitted_at);
        out
    }

    pub fn tasks_with_all_tags(&self, tags: &[&str]) -> Vec<TaskRecord> {
        let Some((first, rest)) = tags.split_first() else {
            return self.all();
        };
        self.tasks_with_tag(first)
            .into_iter()
            .filter(|r| rest.iter().all(|t| r.tags.contains(*t)))
            .collect()
    }

    pub fn all(&self) -> Vec<TaskRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Drops a task and its descendants from the store.
    pub fn remove_tree(&self, id: TaskId) -> usize {
        let mut removed = 0;
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some((_, record)) = self.records.remove(&next) {
                for tag in &record.tags {
                    if let Some(set) = self.tag_index.get(tag) {
                        set.remove(&next);
                    }
                }
                self.runtime.remove(&next);
                stack.extend(record.children);
                removed += 1;
            }
        }
        self.tag_index.retain(|_, set| !set.is_empty());
        removed
    }

    /// Removes every root task whose whole tree has finished.
    pub fn gc_completed(&self) -> usize {
        let roots: Vec<TaskId> = self
            .records
            .iter()
            .filter(|r| r.parent.is_none() && r.status.is_terminal())
            .map(|r| r.id)
            .collect();

        let mut removed = 0;
        for root in roots {
            if self.tree_is_terminal(root) {
                removed += self.remove_tree(root);
            }
        }
        removed
    }

    fn tree_is_terminal(&self, id: TaskId) -> bool {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            match self.records.get(&next) {
                Some(r) => {
                    // an unsubmitted child that was never started will not run any more once
                    // its parent is done
                    if !r.status.is_terminal() && r.status != TaskStatus::Unsubmitted {
                        return false;
                    }
                    stack.extend(r.children.iter().copied());
                }
                None => continue,
            }
        }
        true
    }
}

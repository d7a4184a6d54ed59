use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::runtime::context::TaskContext;

pub type TaskId = Uuid;

/// 任务状态机：Unsubmitted → Queued → InProgress → {Success, Failure, Cancelled}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Unsubmitted,
    Queued,
    InProgress,
    Success,
    Failure,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Unsubmitted => 0,
            TaskStatus::Queued => 1,
            TaskStatus::InProgress => 2,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled => 3,
        }
    }

    /// Status only moves forward; terminal states are final.
    ///
    /// A task that is never started may still end: cancellation before start,
    /// or a validation failure detected before the body runs.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            TaskStatus::Success => self == TaskStatus::InProgress,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Unsubmitted => "not-submitted",
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Success => "done-success",
            TaskStatus::Failure => "done-failure",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompositeMode {
    Sequential,
    Parallel,
}

/// The observable, serializable part of a task. Parent and children are ids
/// resolved through the task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub display_name: String,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub status: TaskStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub composite: Option<CompositeMode>,
    pub continue_on_failure: bool,
    pub timeout: Option<Duration>,
}

impl TaskRecord {
    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Summary exposed across the API boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub display_name: String,
    pub status: TaskStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub tags: Vec<String>,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
}

impl From<&TaskRecord> for TaskSummary {
    fn from(r: &TaskRecord) -> Self {
        Self {
            id: r.id,
            display_name: r.display_name.clone(),
            status: r.status,
            submitted_at: r.submitted_at,
            started_at: r.started_at,
            ended_at: r.ended_at,
            result: r.result.clone(),
            error_message: r.error.as_ref().map(|e| e.message.clone()),
            tags: r.tags.iter().cloned().collect(),
            parent: r.parent,
            children: r.children.clone(),
        }
    }
}

pub type BodyFuture = BoxFuture<'static, Result<Value>>;
pub type TaskFn = Box<dyn FnOnce(TaskContext) -> BodyFuture + Send>;
pub type Validator = Box<dyn FnOnce() -> Result<()> + Send>;

pub enum TaskBody {
    Function(TaskFn),
    Composite,
}

/// 构建一个尚未提交的任务
pub struct TaskBuilder {
    pub(crate) display_name: String,
    pub(crate) description: Option<String>,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) body: TaskBody,
    pub(crate) validator: Option<Validator>,
    pub(crate) composite: Option<(CompositeMode, Vec<TaskBuilder>)>,
    pub(crate) continue_on_failure: bool,
}

impl TaskBuilder {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            description: None,
            tags: BTreeSet::new(),
            timeout: None,
            body: TaskBody::Function(Box::new(|_| Box::pin(async { Ok(Value::Null) }))),
            validator: None,
            composite: None,
            continue_on_failure: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_opt(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn body<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.body = TaskBody::Function(Box::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Checked when the task is picked up, before it is marked started.
    /// A failing validator ends the task in `Failure` with no start time.
    pub fn validate<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.validator = Some(Box::new(f));
        self
    }

    pub fn sequential(mut self, children: Vec<TaskBuilder>) -> Self {
        self.body = TaskBody::Composite;
        self.composite = Some((CompositeMode::Sequential, children));
        self
    }

    pub fn parallel(mut self, children: Vec<TaskBuilder>) -> Self {
        self.body = TaskBody::Composite;
        self.composite = Some((CompositeMode::Parallel, children));
        self
    }

    pub fn continue_on_failure(mut self, value: bool) -> Self {
        self.continue_on_failure = value;
        self
    }
}

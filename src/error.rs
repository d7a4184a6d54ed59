use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// 错误分类，用于在任务记录里保存失败原因，并在 `get()` 时还原
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    IllegalArgument,
    IllegalState,
    UnsupportedOperation,
    NotFound,
    Timeout,
    Cancelled,
    Execution,
    ReplayAmbiguous,
    Transform,
    Persistence,
    Expression,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::IllegalArgument => "illegal-argument",
            ErrorKind::IllegalState => "illegal-state",
            ErrorKind::UnsupportedOperation => "unsupported-operation",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Execution => "execution",
            ErrorKind::ReplayAmbiguous => "replay-ambiguous",
            ErrorKind::Transform => "transform",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Expression => "expression",
        };
        f.write_str(s)
    }
}

/// A failure cause as recorded on a task. Cheap to clone so every observer
/// of a failed task sees the same classified error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Task {task} failed: {cause}")]
    TaskFailed { task: Uuid, cause: TaskError },

    #[error("Workflow {workflow} requires operator intervention: {reason}")]
    ReplayAmbiguous { workflow: String, reason: String },

    #[error("Memento transform failed: {0}")]
    Transform(String),

    #[error("Persistence failure: {0:#}")]
    Persistence(#[from] anyhow::Error),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound { kind, id: id.into() }
    }

    /// The classification of this error; a failed task reports its cause's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::IllegalArgument(_) => ErrorKind::IllegalArgument,
            EngineError::IllegalState(_) => ErrorKind::IllegalState,
            EngineError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Execution(_) => ErrorKind::Execution,
            EngineError::TaskFailed { cause, .. } => cause.kind,
            EngineError::ReplayAmbiguous { .. } => ErrorKind::ReplayAmbiguous,
            EngineError::Transform(_) => ErrorKind::Transform,
            EngineError::Persistence(_) => ErrorKind::Persistence,
            EngineError::Expression(_) => ErrorKind::Expression,
            EngineError::Serialization(_) => ErrorKind::Persistence,
        }
    }

    /// Message without the classification prefix, as shown to API callers.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::IllegalArgument(m)
            | EngineError::IllegalState(m)
            | EngineError::UnsupportedOperation(m)
            | EngineError::Execution(m)
            | EngineError::Transform(m)
            | EngineError::Expression(m) => m.clone(),
            EngineError::TaskFailed { cause, .. } => cause.message.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError::new(self.kind(), self.user_message())
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::runtime::engine::{TaskEngine, TaskHandle};
use crate::runtime::task::{TaskBuilder, TaskId};

/// 运行时上下文 (Task Context)
///
/// Handed to every task body. Cheap to clone; carries the cancellation token
/// that every suspension point in the body should observe.
#[derive(Clone)]
pub struct TaskContext {
    engine: TaskEngine,
    task_id: TaskId,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(engine: TaskEngine, task_id: TaskId, token: CancellationToken) -> Self {
        Self {
            engine,
            task_id,
            token,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task_id
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn tag(&self, tag: impl Into<String>) {
        self.engine.store().add_tag(self.task_id, tag);
    }

    /// Sleeps unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Adds an unsubmitted child under the current task.
    pub fn add_child(&self, builder: TaskBuilder) -> TaskHandle {
        self.engine
            .create_child(builder, self.task_id, &self.token)
    }

    pub async fn spawn_child(&self, builder: TaskBuilder) -> Result<TaskHandle> {
        let handle = self.add_child(builder);
        self.engine.submit(handle.id()).await
    }

    /// Submits a child and blocks on it; interruption-aware.
    pub async fn run_child(&self, builder: TaskBuilder) -> Result<Value> {
        let handle = self.spawn_child(builder).await?;
        self.wait_for(&handle).await
    }

    pub async fn wait_for(&self, handle: &TaskHandle) -> Result<Value> {
        self.engine.wait_cancellable(handle.id(), &self.token).await
    }
}

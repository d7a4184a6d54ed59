use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::runtime::task::TaskId;

/// 提交队列接口：已提交 (Queued) 的任务在这里等待调度
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, task: TaskId) -> Result<()>;
    async fn pop(&self) -> Result<Option<TaskId>>;
}

pub struct InMemoryTaskQueue {
    sender: mpsc::Sender<TaskId>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<TaskId>>,
}

impl InMemoryTaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: tx,
            receiver: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, task: TaskId) -> Result<()> {
        self.sender
            .send(task)
            .await
            .map_err(|e| EngineError::IllegalState(format!("Task queue closed: {}", e)))
    }

    async fn pop(&self) -> Result<Option<TaskId>> {
        let mut rx = self.receiver.lock().await;
        Ok(rx.recv().await)
    }
}

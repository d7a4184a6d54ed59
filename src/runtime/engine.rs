use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, TaskError};
use crate::runtime::context::TaskContext;
use crate::runtime::queue::{InMemoryTaskQueue, TaskQueue};
use crate::runtime::store::{TaskRuntime, TaskStore};
use crate::runtime::task::{
    BodyFuture, CompositeMode, TaskBody, TaskBuilder, TaskId, TaskRecord, TaskStatus, TaskSummary,
};

struct EngineInner {
    store: TaskStore,
    queue: Arc<dyn TaskQueue>,
    default_timeout: Option<Duration>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// 任务执行引擎
///
/// Submitted tasks go through the queue; the dispatcher pops them and runs
/// each body on its own tokio worker.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl Default for TaskEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskEngine {
    pub fn new() -> Self {
        Self::new_with_queue(Arc::new(InMemoryTaskQueue::new(1024)), None)
    }

    pub fn new_with_queue(queue: Arc<dyn TaskQueue>, default_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store: TaskStore::new(),
                queue,
                default_timeout,
                dispatcher: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let queue = Arc::new(InMemoryTaskQueue::new(config.worker_queue_capacity));
        Ok(Self::new_with_queue(queue, config.default_timeout()?))
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    /// Starts the dispatcher if it is not already running. Idempotent.
    pub fn start(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let Ok(mut slot) = self.inner.dispatcher.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let engine = self.clone();
        *slot = Some(tokio::spawn(async move { engine.run_dispatcher().await }));
    }

    /// Stops dispatching and cancels every task that has not finished.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for record in self.store().all() {
            if !record.status.is_terminal() {
                self.cancel(record.id);
            }
        }
        if let Ok(mut slot) = self.inner.dispatcher.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    async fn run_dispatcher(self) {
        info!("Task dispatcher started.");
        loop {
            let next = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                next = self.inner.queue.pop() => next,
            };
            match next {
                Ok(Some(id)) => {
                    let engine = self.clone();
                    tokio::spawn(async move { engine.execute(id).await });
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to take task from queue");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        info!("Task dispatcher stopped.");
    }

    // --- creation & submission ---

    /// Creates an unsubmitted root task (and, for composites, its children).
    pub fn create(&self, builder: TaskBuilder) -> TaskHandle {
        let token = self.inner.shutdown.child_token();
        let id = self.register(builder, None, token);
        self.handle(id)
    }

    pub(crate) fn create_child(
        &self,
        builder: TaskBuilder,
        parent: TaskId,
        parent_token: &CancellationToken,
    ) -> TaskHandle {
        let id = self.register(builder, Some(parent), parent_token.child_token());
        self.store().add_child(parent, id);
        self.handle(id)
    }

    fn register(
        &self,
        builder: TaskBuilder,
        parent: Option<TaskId>,
        token: CancellationToken,
    ) -> TaskId {
        let id = Uuid::new_v4();
        let TaskBuilder {
            display_name,
            description,
            tags,
            timeout,
            body,
            validator,
            composite,
            continue_on_failure,
        } = builder;

        let (mode, child_builders) = match composite {
            Some((mode, children)) => (Some(mode), children),
            None => (None, Vec::new()),
        };

        let record = TaskRecord {
            id,
            display_name,
            description,
            tags,
            status: TaskStatus::Unsubmitted,
            submitted_at: None,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            parent,
            children: Vec::new(),
            composite: mode,
            continue_on_failure,
            timeout,
        };
        let (status_tx, _) = tokio::sync::watch::channel(TaskStatus::Unsubmitted);
        let child_token_source = token.clone();
        self.store().insert(
            record,
            TaskRuntime {
                body: Mutex::new(Some(body)),
                validator: Mutex::new(validator),
                token,
                status_tx,
            },
        );

        for child in child_builders {
            let child_id = self.register(child, Some(id), child_token_source.child_token());
            self.store().add_child(id, child_id);
        }
        id
    }

    pub fn handle(&self, id: TaskId) -> TaskHandle {
        TaskHandle {
            id,
            engine: self.clone(),
        }
    }

    /// Moves a task from Unsubmitted to Queued. A task may only be submitted once.
    pub async fn submit(&self, id: TaskId) -> Result<TaskHandle> {
        self.start();
        let status = self
            .store()
            .status(id)
            .ok_or_else(|| EngineError::not_found("Task", id.to_string()))?;
        if status != TaskStatus::Unsubmitted {
            return Err(EngineError::IllegalState(format!(
                "Task {} has already been submitted ({})",
                id, status
            )));
        }
        self.store().transition(id, TaskStatus::Queued, None, None)?;
        if let Err(e) = self.inner.queue.push(id).await {
            let _ = self
                .store()
                .transition(id, TaskStatus::Failure, None, Some(e.to_task_error()));
            return Err(e);
        }
        debug!(task_id = %id, "Task queued");
        Ok(self.handle(id))
    }

    pub async fn submit_new(&self, builder: TaskBuilder) -> Result<TaskHandle> {
        let handle = self.create(builder);
        self.submit(handle.id).await
    }

    /// Cancels a task. Before start it ends immediately; once running the
    /// body observes the interrupt at its next suspension point.
    pub fn cancel(&self, id: TaskId) -> bool {
        let Some(status) = self.store().status(id) else {
            return false;
        };
        if status.is_terminal() {
            return false;
        }
        if let Some(token) = self.store().token(id) {
            token.cancel();
        }
        if matches!(status, TaskStatus::Unsubmitted | TaskStatus::Queued) {
            let _ = self.store().transition(
                id,
                TaskStatus::Cancelled,
                None,
                Some(TaskError::new(crate::error::ErrorKind::Cancelled, "Cancelled before start")),
            );
            // children that were never started go with it
            for child in self.store().children_of(id) {
                self.cancel(child);
            }
        }
        true
    }

    // --- waiting ---

    pub async fn wait(&self, id: TaskId) -> Result<Value> {
        let mut rx = self
            .store()
            .subscribe(id)
            .ok_or_else(|| EngineError::not_found("Task", id.to_string()))?;
        rx.wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| EngineError::IllegalState(format!("Task {} was discarded", id)))?;
        self.outcome(id)
    }

    /// Waits for `id` unless `token` fires first.
    pub async fn wait_cancellable(&self, id: TaskId, token: &CancellationToken) -> Result<Value> {
        tokio::select! {
            _ = token.cancelled() => Err(EngineError::Cancelled),
            r = self.wait(id) => r,
        }
    }

    fn outcome(&self, id: TaskId) -> Result<Value> {
        let record = self
            .store()
            .get(id)
            .ok_or_else(|| EngineError::not_found("Task", id.to_string()))?;
        match record.status {
            TaskStatus::Success => Ok(record.result.unwrap_or(Value::Null)),
            TaskStatus::Failure => Err(EngineError::TaskFailed {
                task: id,
                cause: record.error.unwrap_or_else(|| {
                    TaskError::new(crate::error::ErrorKind::Execution, "Unknown failure")
                }),
            }),
            TaskStatus::Cancelled => Err(EngineError::Cancelled),
            other => Err(EngineError::IllegalState(format!(
                "Task {} is not done ({})",
                id, other
            ))),
        }
    }

    pub fn summary(&self, id: TaskId) -> Option<TaskSummary> {
        self.store().get(id).as_ref().map(TaskSummary::from)
    }

    pub fn gc_completed(&self) -> usize {
        self.store().gc_completed()
    }

    // --- execution ---

    async fn execute(&self, id: TaskId) {
        let (Some(rt), Some(record)) = (self.store().runtime(id), self.store().get(id)) else {
            warn!(task_id = %id, "Task not found for execution");
            return;
        };
        if record.status != TaskStatus::Queued {
            debug!(task_id = %id, status = %record.status, "Skipping task that is no longer queued");
            return;
        }
        if rt.token.is_cancelled() {
            let _ = self.store().transition(id, TaskStatus::Cancelled, None, None);
            return;
        }

        let validator = rt.validator.lock().ok().and_then(|mut v| v.take());
        if let Some(validate) = validator {
            if let Err(e) = validate() {
                warn!(task_id = %id, task = %record.display_name, error = %e, "Task rejected before start");
                let _ = self
                    .store()
                    .transition(id, TaskStatus::Failure, None, Some(e.to_task_error()));
                return;
            }
        }

        if self
            .store()
            .transition(id, TaskStatus::InProgress, None, None)
            .is_err()
        {
            // lost a race with cancel
            return;
        }

        let body = rt.body.lock().ok().and_then(|mut b| b.take());
        let ctx = TaskContext::new(self.clone(), id, rt.token.clone());
        let fut: BodyFuture = match body {
            Some(TaskBody::Function(f)) => f(ctx),
            Some(TaskBody::Composite) => {
                let mode = record.composite.unwrap_or(CompositeMode::Sequential);
                Box::pin(run_composite(ctx, mode, record.continue_on_failure))
            }
            None => Box::pin(async move {
                Err(EngineError::IllegalState(format!("Task {} has no body to run", id)))
            }),
        };

        let limit = record.timeout.or(self.inner.default_timeout);
        let outcome = tokio::select! {
            biased;
            _ = rt.token.cancelled() => Err(EngineError::Cancelled),
            r = run_with_timeout(fut, limit) => r,
        };
        if matches!(outcome, Err(EngineError::Timeout(_))) {
            // best-effort: stop anything the body left running
            rt.token.cancel();
        }
        self.complete(id, &record.display_name, outcome);
    }

    fn complete(&self, id: TaskId, name: &str, outcome: Result<Value>) {
        let res = match outcome {
            Ok(value) => self
                .store()
                .transition(id, TaskStatus::Success, Some(value), None),
            Err(e) if e.is_cancellation() => {
                debug!(task_id = %id, task = name, "Task cancelled");
                self.store()
                    .transition(id, TaskStatus::Cancelled, None, Some(e.to_task_error()))
            }
            Err(e) => {
                warn!(task_id = %id, task = name, error = %e, "Task failed");
                self.store()
                    .transition(id, TaskStatus::Failure, None, Some(e.to_task_error()))
            }
        };
        if let Err(e) = res {
            debug!(task_id = %id, error = %e, "Could not record task outcome");
        }
    }
}

async fn run_with_timeout(fut: BodyFuture, limit: Option<Duration>) -> Result<Value> {
    match limit {
        Some(d) => timeout(d, fut).await.unwrap_or(Err(EngineError::Timeout(d))),
        None => fut.await,
    }
}

fn cancel_all(engine: &TaskEngine, ids: &[TaskId]) {
    for id in ids {
        engine.cancel(*id);
    }
}

async fn run_composite(
    ctx: TaskContext,
    mode: CompositeMode,
    continue_on_failure: bool,
) -> Result<Value> {
    let engine = ctx.engine().clone();
    let children = engine.store().children_of(ctx.id());

    match mode {
        CompositeMode::Sequential => {
            let mut results = Vec::with_capacity(children.len());
            let mut first_error = None;
            for (i, child) in children.iter().enumerate() {
                if let Err(e) = ctx.check_cancelled() {
                    cancel_all(&engine, &children[i..]);
                    return Err(e);
                }
                let handle = engine.submit(*child).await?;
                match ctx.wait_for(&handle).await {
                    Ok(v) => results.push(v),
                    Err(e) if continue_on_failure && !ctx.is_cancelled() => {
                        results.push(Value::Null);
                        first_error.get_or_insert(e);
                    }
                    Err(e) => {
                        // the failed child is already terminal; the rest never start
                        cancel_all(&engine, &children[i..]);
                        return Err(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(Value::Array(results)),
            }
        }
        CompositeMode::Parallel => {
            let mut handles = Vec::with_capacity(children.len());
            for child in &children {
                handles.push(engine.submit(*child).await?);
            }
            let outcomes = join_all(handles.iter().map(|h| ctx.wait_for(h))).await;
            ctx.check_cancelled()?;

            let mut results = Vec::with_capacity(outcomes.len());
            let mut first_error = None;
            for outcome in outcomes {
                match outcome {
                    Ok(v) => results.push(v),
                    Err(e) => {
                        results.push(Value::Null);
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(Value::Array(results)),
            }
        }
    }
}

/// 任务句柄：对任务仓库中一条记录的引用
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    engine: TaskEngine,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        self.engine
            .store()
            .status(self.id)
            .unwrap_or(TaskStatus::Cancelled)
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn record(&self) -> Option<TaskRecord> {
        self.engine.store().get(self.id)
    }

    pub async fn submit(&self) -> Result<TaskHandle> {
        self.engine.submit(self.id).await
    }

    /// Blocks until the task is done; a failure is re-raised to the caller.
    pub async fn get(&self) -> Result<Value> {
        self.engine.wait(self.id).await
    }

    pub async fn get_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.get().await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn cancel(&self) -> bool {
        self.engine.cancel(self.id)
    }
}

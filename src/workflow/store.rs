use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{EngineError, Result};
use crate::management::ManagementContext;
use crate::workflow::context::WorkflowExecutionContext;

/// Receives every durable workflow update. The persister implements this so
/// that step boundaries reach the memento store before the workflow advances.
#[async_trait]
pub trait WorkflowCheckpointSink: Send + Sync {
    async fn workflow_updated(
        &self,
        mgmt: &ManagementContext,
        workflow: &WorkflowExecutionContext,
    ) -> Result<()>;
}

/// 工作流上下文仓库 (arena by workflow id)
#[derive(Default)]
pub struct WorkflowStore {
    contexts: DashMap<String, WorkflowExecutionContext>,
    sink: RwLock<Option<Arc<dyn WorkflowCheckpointSink>>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sink(&self, sink: Arc<dyn WorkflowCheckpointSink>) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = Some(sink);
        }
    }

    pub fn clear_sink(&self) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = None;
        }
    }

    pub fn insert(&self, ctx: WorkflowExecutionContext) {
        self.contexts.insert(ctx.id.clone(), ctx);
    }

    pub fn get(&self, id: &str) -> Option<WorkflowExecutionContext> {
        self.contexts.get(id).map(|c| c.value().clone())
    }

    pub fn require(&self, id: &str) -> Result<WorkflowExecutionContext> {
        self.get(id)
            .ok_or_else(|| EngineError::not_found("Workflow", id))
    }

    /// Mutates one context in place. `f` must not call back into the store.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut WorkflowExecutionContext) -> R) -> Result<R> {
        let mut entry = self
            .contexts
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("Workflow", id))?;
        let out = f(entry.value_mut());
        entry.value_mut().touch();
        Ok(out)
    }

    pub fn remove(&self, id: &str) -> Option<WorkflowExecutionContext> {
        self.contexts.remove(id).map(|(_, c)| c)
    }

    pub fn all(&self) -> Vec<WorkflowExecutionContext> {
        let mut all: Vec<_> = self.contexts.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn for_entity(&self, entity_id: &str) -> Vec<WorkflowExecutionContext> {
        self.all()
            .into_iter()
            .filter(|c| c.entity_id == entity_id)
            .collect()
    }

    /// Sub-workflows whose parent is `id`.
    pub fn children_of(&self, id: &str) -> Vec<WorkflowExecutionContext> {
        self.all()
            .into_iter()
            .filter(|c| c.parent.as_ref().is_some_and(|p| p.workflow_id == id))
            .collect()
    }

    pub fn remove_for_entity(&self, entity_id: &str) {
        self.contexts.retain(|_, c| c.entity_id != entity_id);
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Hands the current state of `id` to the sink, if one is installed.
    pub async fn checkpoint(&self, mgmt: &ManagementContext, id: &str) -> Result<()> {
        let sink = self.sink.read().ok().and_then(|s| s.clone());
        let Some(sink) = sink else {
            return Ok(());
        };
        let ctx = self.require(id)?;
        sink.workflow_updated(mgmt, &ctx).await
    }
}

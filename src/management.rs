use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::entity::{Entity, EntityRegistry, EntitySpec, EntityTypeRegistry};
use crate::error::{EngineError, Result};
use crate::runtime::engine::TaskEngine;
use crate::runtime::invocation::invoke;
use crate::runtime::task::{TaskId, TaskSummary};
use crate::workflow::executor::WorkflowExecutor;
use crate::workflow::registry::StepRegistry;
use crate::workflow::store::WorkflowStore;

struct ManagementInner {
    config: EngineConfig,
    tasks: TaskEngine,
    entities: EntityRegistry,
    entity_types: EntityTypeRegistry,
    steps: StepRegistry,
    workflows: WorkflowStore,
    plane_id: RwLock<String>,
}

/// 管理上下文：进程内所有注册表与引擎的拥有者
///
/// Registries live here rather than in statics; they are populated by
/// [`ManagementContext::new`] and emptied by [`ManagementContext::shutdown`].
#[derive(Clone)]
pub struct ManagementContext {
    inner: Arc<ManagementInner>,
}

impl ManagementContext {
    /// Inside a tokio runtime the task dispatcher is started right away;
    /// otherwise call `tasks().start()` once a runtime exists.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let tasks = TaskEngine::from_config(&config)?;
        if tokio::runtime::Handle::try_current().is_ok() {
            tasks.start();
        }
        let steps = StepRegistry::with_builtins()?;
        Ok(Self {
            inner: Arc::new(ManagementInner {
                config,
                tasks,
                entities: EntityRegistry::new(),
                entity_types: EntityTypeRegistry::new(),
                steps,
                workflows: WorkflowStore::new(),
                plane_id: RwLock::new(Uuid::new_v4().simple().to_string()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn tasks(&self) -> &TaskEngine {
        &self.inner.tasks
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.inner.entities
    }

    pub fn entity_types(&self) -> &EntityTypeRegistry {
        &self.inner.entity_types
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.inner.steps
    }

    pub fn workflows(&self) -> &WorkflowStore {
        &self.inner.workflows
    }

    pub fn workflow_executor(&self) -> WorkflowExecutor {
        WorkflowExecutor::new(self.clone())
    }

    pub fn plane_id(&self) -> String {
        self.inner
            .plane_id
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Rebind adopts the persisted plane id.
    pub fn set_plane_id(&self, plane_id: impl Into<String>) {
        if let Ok(mut p) = self.inner.plane_id.write() {
            *p = plane_id.into();
        }
    }

    /// Builds an entity through the type registry and registers it (unmanaged).
    pub fn create_entity(&self, spec: EntitySpec) -> Result<Arc<Entity>> {
        let entity = self.entity_types().instantiate(self, spec)?;
        self.entities().register(entity.clone())?;
        Ok(entity)
    }

    pub fn manage(&self, entity: &Arc<Entity>) -> Result<()> {
        self.entities().manage(entity)
    }

    pub fn unmanage(&self, entity_id: &str) -> Option<Arc<Entity>> {
        let entity = self.entities().unmanage(entity_id)?;
        self.workflows().remove_for_entity(entity_id);
        Some(entity)
    }

    /// REST-style boundary: invoke by ids, returning the submitted task's id.
    pub async fn invoke_effector(
        &self,
        entity_id: &str,
        effector_name: &str,
        params: Map<String, Value>,
    ) -> Result<TaskId> {
        let entity = self.entities().require(entity_id)?;
        let effector = entity
            .effector(effector_name)
            .ok_or_else(|| EngineError::not_found("Effector", effector_name))?;
        let handle = invoke(self, &entity, &effector, params)?;
        handle.submit().await?;
        Ok(handle.id())
    }

    pub fn task_summary(&self, id: TaskId) -> Result<TaskSummary> {
        self.tasks()
            .summary(id)
            .ok_or_else(|| EngineError::not_found("Task", id.to_string()))
    }

    /// Stops feeds, cancels outstanding tasks and empties the registries.
    pub fn shutdown(&self) {
        info!(plane_id = %self.plane_id(), "Management context shutting down");
        self.entities().clear();
        self.tasks().shutdown();
        self.steps().clear();
        self.entity_types().clear();
    }
}

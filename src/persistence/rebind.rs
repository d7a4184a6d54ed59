use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::entity::Entity;
use crate::error::{EngineError, ErrorKind, Result, TaskError};
use crate::feed::Feed;
use crate::feed::source::PollConfig;
use crate::management::ManagementContext;
use crate::persistence::memento::{BrooklynObjectType, EntityMemento, FeedMemento};
use crate::persistence::store::MementoStore;
use crate::persistence::transformer::CompoundTransformer;
use crate::workflow::context::WorkflowStatus;

/// What a rebind restored.
#[derive(Debug, Default, Clone)]
pub struct RebindReport {
    pub plane_id: Option<String>,
    pub entities: Vec<String>,
    pub feeds_restored: Vec<String>,
    /// Feed mementos that could not be rebuilt and had no replacement from
    /// the entity's initializer.
    pub feeds_skipped: Vec<String>,
    pub workflows_restored: usize,
    pub workflows_resumed: Vec<String>,
    /// Workflows that failed to resume, with the reason.
    pub workflows_failed: BTreeMap<String, String>,
}

/// 重建：从持久化数据恢复实体、feed 与工作流
pub struct RebindManager {
    mgmt: ManagementContext,
    store: Arc<dyn MementoStore>,
    transformer: Option<CompoundTransformer>,
    resume_workflows: bool,
}

impl RebindManager {
    pub fn new(mgmt: ManagementContext, store: Arc<dyn MementoStore>) -> Self {
        Self {
            mgmt,
            store,
            transformer: None,
            resume_workflows: true,
        }
    }

    /// Applied to the loaded data before anything is reconstructed.
    pub fn with_transformer(mut self, transformer: CompoundTransformer) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn resume_workflows(mut self, resume: bool) -> Self {
        self.resume_workflows = resume;
        self
    }

    pub async fn rebind(&self) -> Result<RebindReport> {
        let mut raw = self.store.load_raw_data().await?;
        if let Some(transformer) = &self.transformer {
            raw = transformer.transform(&raw)?;
        }
        let mut report = RebindReport {
            plane_id: raw.plane_id.clone(),
            ..Default::default()
        };
        if let Some(plane_id) = &raw.plane_id {
            self.mgmt.set_plane_id(plane_id.clone());
        }
        for (group, ids) in &raw.unknown {
            warn!(group = %group, count = ids.len(), "Ignoring mementos of unknown type");
        }

        // entities
        let mut mementos = Vec::new();
        if let Some(group) = raw.objects(BrooklynObjectType::Entity) {
            for (id, content) in group {
                let memento = EntityMemento::from_xml(content).map_err(|e| {
                    EngineError::Persistence(anyhow::anyhow!("Entity memento {}: {}", id, e))
                })?;
                mementos.push(memento);
            }
        }
        let mut managed = Vec::new();
        for memento in &mementos {
            let entity = self.restore_entity(memento)?;
            if memento.managed {
                managed.push(entity);
            }
            report.entities.push(memento.id.clone());
        }

        // feeds, before managing so the right ones start
        if let Some(group) = raw.objects(BrooklynObjectType::Feed) {
            for (id, content) in group {
                match self.restore_feed(content) {
                    Ok(true) => report.feeds_restored.push(id.clone()),
                    Ok(false) => report.feeds_skipped.push(id.clone()),
                    Err(e) => {
                        warn!(feed = %id, "Failed to restore feed: {}", e);
                        report.feeds_skipped.push(id.clone());
                    }
                }
            }
        }

        for entity in &managed {
            self.mgmt.manage(entity)?;
        }

        // workflows
        for memento in mementos {
            for ctx in memento.workflows {
                self.mgmt.workflows().insert(ctx);
                report.workflows_restored += 1;
            }
        }
        if self.resume_workflows {
            self.resume(&mut report).await?;
        }

        info!(
            entities = report.entities.len(),
            feeds = report.feeds_restored.len(),
            workflows = report.workflows_restored,
            resumed = report.workflows_resumed.len(),
            "Rebind complete"
        );
        Ok(report)
    }

    fn restore_entity(&self, memento: &EntityMemento) -> Result<Arc<Entity>> {
        if !self.mgmt.entity_types().is_known(&memento.type_name) {
            warn!(entity_id = %memento.id, type_name = %memento.type_name, "No initializer for persisted type");
        }
        let entity = self.mgmt.create_entity(memento.to_spec())?;
        for (name, value) in &memento.sensors {
            entity.set_sensor(name, value.clone());
        }
        debug!(entity_id = %entity.id(), "Entity restored");
        Ok(entity)
    }

    /// Returns whether a feed now exists for the memento.
    fn restore_feed(&self, content: &str) -> Result<bool> {
        let memento = FeedMemento::from_xml(content)?;
        let spec = &memento.spec;
        let entity = self.mgmt.entities().require(&spec.entity_id)?;

        // the initializer already recreated it under the same deterministic tag
        if let Some(existing) = entity.feed(&spec.unique_tag) {
            if spec.suspended {
                existing.suspend();
            }
            return Ok(true);
        }

        let polls = match spec.polls.iter().map(PollConfig::from_spec).collect::<Result<Vec<_>>>() {
            Ok(polls) => polls,
            Err(e) if e.kind() == ErrorKind::UnsupportedOperation => {
                warn!(
                    entity_id = %spec.entity_id,
                    feed = %spec.unique_tag,
                    "Feed cannot be rebuilt from its memento: {}",
                    e.user_message()
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let mut builder = Feed::builder(&self.mgmt, &entity)
            .unique_tag(spec.unique_tag.clone())
            .period(std::time::Duration::from_millis(spec.period_ms))
            .suspended(spec.suspended);
        for poll in polls {
            builder = builder.poll(poll);
        }
        builder.attach()?;
        Ok(true)
    }

    async fn resume(&self, report: &mut RebindReport) -> Result<()> {
        let executor = self.mgmt.workflow_executor();
        for ctx in executor.interrupted() {
            // nested runs are redone by their parent's replay
            if ctx.parent.is_some() {
                self.mgmt.workflows().update(&ctx.id, |c| {
                    c.status = WorkflowStatus::Failed;
                    c.error = Some(TaskError::new(
                        ErrorKind::IllegalState,
                        "Interrupted by restart; resumed through the parent workflow",
                    ));
                })?;
                continue;
            }
            match executor.replay_from_last(&ctx.id).await {
                Ok(_) => report.workflows_resumed.push(ctx.id.clone()),
                Err(e) => {
                    warn!(workflow_id = %ctx.id, "Workflow not resumed: {}", e);
                    report.workflows_failed.insert(ctx.id.clone(), e.user_message());
                }
            }
        }
        Ok(())
    }
}

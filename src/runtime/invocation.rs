use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::management::ManagementContext;
use crate::runtime::effector::{Effector, EffectorInvocation, InvocationOptions};
use crate::runtime::engine::TaskHandle;
use crate::runtime::task::TaskBuilder;

pub const EFFECTOR_TAG: &str = "EFFECTOR";

pub fn effector_tag(name: &str) -> String {
    format!("effector:{}", name)
}

pub fn entity_tag(id: &str) -> String {
    format!("entity:{}", id)
}

/// Builds an unsubmitted task invoking `effector` on `entity`.
pub fn invoke(
    mgmt: &ManagementContext,
    entity: &Arc<Entity>,
    effector: &Arc<Effector>,
    params: Map<String, Value>,
) -> Result<TaskHandle> {
    let builder = effector_task(mgmt, entity, effector, params, InvocationOptions::default())?;
    Ok(mgmt.tasks().create(builder))
}

/// Resolves the effector actually run and builds its task.
///
/// If the entity registers a different instance under the same name, that
/// instance wins. The supplied effector's body is the fallback when the
/// registered one has none.
pub fn effector_task(
    mgmt: &ManagementContext,
    entity: &Arc<Entity>,
    effector: &Arc<Effector>,
    params: Map<String, Value>,
    options: InvocationOptions,
) -> Result<TaskBuilder> {
    let target = match entity.effector(effector.name()) {
        Some(registered) if !Effector::same_instance(&registered, effector) => {
            debug!(
                entity_id = %entity.id(),
                effector = effector.name(),
                same_signature = registered.same_signature(effector),
                "Using effector registered on entity instead of supplied instance"
            );
            registered
        }
        _ => effector.clone(),
    };

    let body = target.body().or_else(|| effector.body()).ok_or_else(|| {
        EngineError::UnsupportedOperation(format!(
            "No implementation for effector {} on {}",
            effector.name(),
            entity.display_name()
        ))
    })?;
    let params = target.resolve_parameters(params)?;

    let mut builder = TaskBuilder::new(format!(
        "Invoking effector {} on {}",
        target.name(),
        entity.display_name()
    ))
    .description(format!("Effector {} with parameters {}", target.name(), Value::Object(params.clone())))
    .tag(EFFECTOR_TAG)
    .tag(effector_tag(target.name()))
    .tag(entity_tag(entity.id()));

    if body.is_workflow() {
        builder = builder.tag(crate::workflow::WORKFLOW_TAG);
        if let Some(parent) = &options.parent_workflow {
            builder = builder.tag(format!("sub-workflow-of:{}", parent.workflow_id));
        }
    }

    let mgmt = mgmt.clone();
    let entity = entity.clone();
    Ok(builder.body(move |task| async move {
        body.call(EffectorInvocation {
            mgmt,
            entity,
            effector: target,
            params,
            task,
            options,
        })
        .await
    }))
}

fn fan_out(
    mgmt: &ManagementContext,
    effector: &Arc<Effector>,
    params: &Map<String, Value>,
    entities: &[Arc<Entity>],
) -> Result<Vec<TaskBuilder>> {
    entities
        .iter()
        .map(|e| effector_task(mgmt, e, effector, params.clone(), InvocationOptions::default()))
        .collect()
}

/// One child per entity, run concurrently. The result lists child results
/// in entity order; the aggregate fails once all children are done if any failed.
///
/// Parameters are resolved per entity up front: if any entity rejects them,
/// the whole fan-out fails here and no child task is created.
pub fn invocation_parallel(
    mgmt: &ManagementContext,
    effector: &Arc<Effector>,
    params: Map<String, Value>,
    entities: &[Arc<Entity>],
) -> Result<TaskHandle> {
    let children = fan_out(mgmt, effector, &params, entities)?;
    let builder = TaskBuilder::new(format!(
        "Invoking {} on {} entities in parallel",
        effector.name(),
        entities.len()
    ))
    .tag(EFFECTOR_TAG)
    .tag(effector_tag(effector.name()))
    .parallel(children);
    Ok(mgmt.tasks().create(builder))
}

/// Like [`invocation_parallel`] but strictly in order; the first failure
/// stops the remaining children from ever starting.
pub fn invocation_sequential(
    mgmt: &ManagementContext,
    effector: &Arc<Effector>,
    params: Map<String, Value>,
    entities: &[Arc<Entity>],
) -> Result<TaskHandle> {
    let children = fan_out(mgmt, effector, &params, entities)?;
    let builder = TaskBuilder::new(format!(
        "Invoking {} on {} entities in sequence",
        effector.name(),
        entities.len()
    ))
    .tag(EFFECTOR_TAG)
    .tag(effector_tag(effector.name()))
    .sequential(children);
    Ok(mgmt.tasks().create(builder))
}

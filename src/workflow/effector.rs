use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::runtime::effector::{EffectorBody, EffectorInvocation};
use crate::workflow::WorkflowDefinition;

/// An effector implemented as a declarative workflow. Parameters become the
/// workflow's `input`.
#[derive(Debug, Clone)]
pub struct WorkflowEffectorBody {
    definition: WorkflowDefinition,
}

impl WorkflowEffectorBody {
    pub fn new(definition: WorkflowDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }
}

#[async_trait]
impl EffectorBody for WorkflowEffectorBody {
    async fn call(&self, invocation: EffectorInvocation) -> Result<Value> {
        let executor = invocation.mgmt.workflow_executor();
        let ctx = executor.create(
            &invocation.entity,
            &self.definition,
            invocation.params,
            invocation.options.parent_workflow.clone(),
        )?;
        if let Some(notify) = &invocation.options.on_sub_workflow {
            notify(ctx.tag());
        }
        debug!(
            workflow_id = %ctx.id,
            effector = invocation.effector.name(),
            parent = ?invocation.options.parent_workflow.as_ref().map(|p| &p.workflow_id),
            "Running workflow effector"
        );
        executor.run_in_task(&ctx.id, invocation.task).await
    }

    fn is_workflow(&self) -> bool {
        true
    }
}

pub mod builder;
pub mod builtin;
pub mod context;
pub mod effector;
pub mod executor;
pub mod interpolate;
pub mod loader;
pub mod registry;
pub mod shorthand;
pub mod step;
pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::workflow::registry::StepRegistry;
use crate::workflow::step::WorkflowStepDefinition;

pub use builder::WorkflowBuilder;
pub use context::{StepRecord, StepState, WorkflowExecutionContext, WorkflowStatus, WorkflowTag};
pub use effector::WorkflowEffectorBody;
pub use executor::{WorkflowExecutor, WorkflowRun};
pub use step::{StepBehavior, StepKind};
pub use store::{WorkflowCheckpointSink, WorkflowStore};

/// Tag carried by every task that runs a workflow.
pub const WORKFLOW_TAG: &str = "WORKFLOW";

/// 工作流定义：有序步骤列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<WorkflowStepDefinition>,
    /// Overrides the last step's output as the workflow's result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStepDefinition>) -> Self {
        Self {
            name: name.into(),
            steps,
            output: None,
        }
    }

    /// Builds a definition from raw step values (shorthand strings or maps).
    pub fn parse(registry: &StepRegistry, name: impl Into<String>, steps: &[Value]) -> Result<Self> {
        Ok(Self::new(name, registry.parse_steps(steps)?))
    }

    pub fn is_idempotent(&self) -> bool {
        self.steps.iter().all(|s| s.is_idempotent())
    }
}

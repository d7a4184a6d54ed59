use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::Entity;
use crate::error::TaskError;
use crate::management::ManagementContext;
use crate::runtime::context::TaskContext;
use crate::runtime::task::TaskId;
use crate::workflow::step::WorkflowStepDefinition;

/// Identifies one workflow run, optionally pinned to a step of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowTag {
    pub workflow_id: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
}

impl WorkflowTag {
    pub fn new(workflow_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            entity_id: entity_id.into(),
            step_index: None,
        }
    }

    pub fn at_step(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Replaying { from_step: usize },
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    Started,
    Completed,
    Failed,
    Skipped,
}

/// The durable record of one step: written when the step starts and again
/// when it reaches a boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub state: StepState,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars_after: Option<Map<String, Value>>,
    pub attempts: u32,
    #[serde(default)]
    pub sub_workflows: Vec<WorkflowTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn new(index: usize, step_id: Option<String>, input: Value) -> Self {
        Self {
            index,
            step_id,
            state: StepState::Started,
            input,
            output: None,
            vars_after: None,
            attempts: 0,
            sub_workflows: Vec::new(),
            task_id: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self.state, StepState::Completed | StepState::Skipped)
    }
}

/// 一次工作流运行的全部状态
///
/// `vars` and `last_output` only ever hold the state as of the last completed
/// step boundary, so a replay can restart from them without seeing the
/// partial effects of an interrupted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionContext {
    pub id: String,
    pub entity_id: String,
    pub name: String,
    pub steps: Vec<WorkflowStepDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_template: Option<Value>,
    pub status: WorkflowStatus,
    pub current_step: Option<usize>,
    pub records: BTreeMap<usize, StepRecord>,
    pub input: Map<String, Value>,
    pub vars: Map<String, Value>,
    pub last_output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<WorkflowTag>,
    #[serde(default)]
    pub children: Vec<WorkflowTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub replay_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecutionContext {
    pub fn tag(&self) -> WorkflowTag {
        WorkflowTag::new(&self.id, &self.entity_id)
    }

    pub fn step_record(&self, index: usize) -> Option<&StepRecord> {
        self.records.get(&index)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Effects a step asks for; applied by the executor only once the step
/// reaches its boundary.
#[derive(Debug, Default)]
pub(crate) struct StepEffects {
    vars: Mutex<Map<String, Value>>,
    end_workflow: AtomicBool,
    sub_workflows: Mutex<Vec<WorkflowTag>>,
}

impl StepEffects {
    pub(crate) fn take_vars(&self) -> Map<String, Value> {
        self.vars
            .lock()
            .map(|mut v| std::mem::take(&mut *v))
            .unwrap_or_default()
    }

    pub(crate) fn ends_workflow(&self) -> bool {
        self.end_workflow.load(Ordering::SeqCst)
    }

    pub(crate) fn push_sub_workflow(&self, tag: WorkflowTag) {
        if let Ok(mut subs) = self.sub_workflows.lock() {
            subs.push(tag);
        }
    }

    pub(crate) fn sub_workflows(&self) -> Vec<WorkflowTag> {
        self.sub_workflows
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// Per-invocation state handed to a step's behaviour.
#[derive(Clone)]
pub struct WorkflowStepInstanceExecutionContext {
    pub mgmt: ManagementContext,
    pub entity: Arc<Entity>,
    pub workflow: WorkflowTag,
    pub step_index: usize,
    pub input: Map<String, Value>,
    pub vars: Map<String, Value>,
    pub previous_output: Value,
    pub task: TaskContext,
    pub(crate) effects: Arc<StepEffects>,
}

impl WorkflowStepInstanceExecutionContext {
    pub fn previous_output(&self) -> Value {
        self.previous_output.clone()
    }

    /// Visible to later steps once this one completes.
    pub fn set_var(&self, name: impl Into<String>, value: Value) {
        if let Ok(mut vars) = self.effects.vars.lock() {
            vars.insert(name.into(), value);
        }
    }

    /// Makes this step's output the workflow's output and skips the rest.
    pub fn end_workflow(&self) {
        self.effects.end_workflow.store(true, Ordering::SeqCst);
    }

    pub fn tag(&self) -> WorkflowTag {
        self.workflow.clone().at_step(self.step_index)
    }

    pub fn record_sub_workflow(&self, tag: WorkflowTag) {
        self.effects.push_sub_workflow(tag);
    }
}

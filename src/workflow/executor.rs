use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::management::ManagementContext;
use crate::runtime::context::TaskContext;
use crate::runtime::engine::TaskHandle;
use crate::runtime::invocation::entity_tag;
use crate::runtime::task::{TaskBuilder, TaskId};
use crate::workflow::builtin::resolve_kind;
use crate::workflow::context::{
    StepEffects, StepRecord, StepState, WorkflowExecutionContext, WorkflowStatus,
    WorkflowStepInstanceExecutionContext, WorkflowTag,
};
use crate::workflow::interpolate::{Scope, evaluate_condition, resolve_value};
use crate::workflow::step::{StepBehavior, WorkflowStepDefinition};
use crate::workflow::{WORKFLOW_TAG, WorkflowDefinition};

pub const WORKFLOW_STEP_TAG: &str = "WORKFLOW_STEP";

pub fn workflow_tag(workflow_id: &str) -> String {
    format!("workflow:{}", workflow_id)
}

pub fn step_tag(workflow_id: &str, index: usize) -> String {
    format!("workflow-step:{}:{}", workflow_id, index)
}

/// A submitted workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub task: TaskHandle,
}

impl WorkflowRun {
    pub async fn get(&self) -> Result<Value> {
        self.task.get().await
    }
}

struct StepOutcome {
    output: Value,
    vars: Map<String, Value>,
    ends_workflow: bool,
    sub_workflows: Vec<WorkflowTag>,
}

/// 工作流执行器
///
/// Each workflow runs as one task; each step as a child task of it. Step
/// boundaries are written to the workflow store and checkpointed before
/// the next step begins.
#[derive(Clone)]
pub struct WorkflowExecutor {
    mgmt: ManagementContext,
}

impl WorkflowExecutor {
    pub fn new(mgmt: ManagementContext) -> Self {
        Self { mgmt }
    }

    /// Registers a new run in `Created` state, linked to `parent` if given.
    pub fn create(
        &self,
        entity: &Arc<Entity>,
        definition: &WorkflowDefinition,
        input: Map<String, Value>,
        parent: Option<WorkflowTag>,
    ) -> Result<WorkflowExecutionContext> {
        if definition.steps.is_empty() {
            return Err(EngineError::IllegalArgument(format!(
                "Workflow '{}' has no steps",
                definition.name
            )));
        }
        for step in &definition.steps {
            step.timeout()?;
        }
        let now = Utc::now();
        let ctx = WorkflowExecutionContext {
            id: Uuid::new_v4().simple().to_string(),
            entity_id: entity.id().to_string(),
            name: definition.name.clone(),
            steps: definition.steps.clone(),
            output_template: definition.output.clone(),
            status: WorkflowStatus::Created,
            current_step: None,
            records: Default::default(),
            input,
            vars: Map::new(),
            last_output: Value::Null,
            output: None,
            error: None,
            parent: parent.clone(),
            children: Vec::new(),
            task_id: None,
            replay_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.mgmt.workflows().insert(ctx.clone());
        if let Some(parent) = parent {
            let tag = ctx.tag();
            // parent may be gone if it was unmanaged meanwhile
            let _ = self
                .mgmt
                .workflows()
                .update(&parent.workflow_id, |p| p.children.push(tag));
        }
        debug!(workflow_id = %ctx.id, entity_id = %ctx.entity_id, name = %ctx.name, "Workflow created");
        Ok(ctx)
    }

    fn workflow_task(&self, ctx: &WorkflowExecutionContext, from_step: usize) -> TaskBuilder {
        let executor = self.clone();
        let id = ctx.id.clone();
        TaskBuilder::new(format!("Workflow {}", ctx.name))
            .description(format!("Workflow {} from step {}", ctx.id, from_step + 1))
            .tag(WORKFLOW_TAG)
            .tag(workflow_tag(&ctx.id))
            .tag(entity_tag(&ctx.entity_id))
            .body(move |task| async move { executor.run_steps(&id, from_step, task).await })
    }

    pub async fn start(
        &self,
        entity: &Arc<Entity>,
        definition: &WorkflowDefinition,
        input: Map<String, Value>,
    ) -> Result<WorkflowRun> {
        let ctx = self.create(entity, definition, input, None)?;
        self.launch(&ctx, 0).await
    }

    pub async fn run(
        &self,
        entity: &Arc<Entity>,
        definition: &WorkflowDefinition,
        input: Map<String, Value>,
    ) -> Result<Value> {
        self.start(entity, definition, input).await?.get().await
    }

    async fn launch(&self, ctx: &WorkflowExecutionContext, from_step: usize) -> Result<WorkflowRun> {
        let handle = self.mgmt.tasks().create(self.workflow_task(ctx, from_step));
        self.mgmt
            .workflows()
            .update(&ctx.id, |c| c.task_id = Some(handle.id()))?;
        if let Err(e) = self.checkpoint(&ctx.id).await {
            // the task never ran; end it instead of leaving it Unsubmitted
            handle.cancel();
            return Err(e);
        }
        handle.submit().await?;
        self.watch(&ctx.id, handle.id());
        info!(workflow_id = %ctx.id, entity_id = %ctx.entity_id, from_step, "Workflow submitted");
        Ok(WorkflowRun {
            workflow_id: ctx.id.clone(),
            task: handle,
        })
    }

    /// Runs a workflow effector's steps inside the effector's own task.
    pub(crate) async fn run_in_task(&self, workflow_id: &str, task: TaskContext) -> Result<Value> {
        self.mgmt
            .workflows()
            .update(workflow_id, |c| c.task_id = Some(task.id()))?;
        self.watch(workflow_id, task.id());
        self.run_steps(workflow_id, 0, task).await
    }

    /// Runs inline steps as a sub-workflow of the calling step.
    pub(crate) async fn run_nested(
        &self,
        parent: &WorkflowStepInstanceExecutionContext,
        steps: Vec<WorkflowStepDefinition>,
    ) -> Result<Value> {
        let definition = WorkflowDefinition {
            name: format!("{} step {}", parent.workflow.workflow_id, parent.step_index + 1),
            steps,
            output: None,
        };
        let child = self.create(
            &parent.entity,
            &definition,
            parent.input.clone(),
            Some(parent.tag()),
        )?;
        let vars = parent.vars.clone();
        let previous = parent.previous_output();
        self.mgmt.workflows().update(&child.id, |c| {
            c.vars = vars;
            c.last_output = previous;
        })?;
        parent.record_sub_workflow(child.tag());

        let handle = parent.task.add_child(self.workflow_task(&child, 0));
        self.mgmt
            .workflows()
            .update(&child.id, |c| c.task_id = Some(handle.id()))?;
        handle.submit().await?;
        self.watch(&child.id, handle.id());
        parent.task.wait_for(&handle).await
    }

    /// Marks the workflow cancelled or failed if its task ends without the
    /// body getting the chance to record it (cancellation drops the body).
    fn watch(&self, workflow_id: &str, task_id: TaskId) {
        let executor = self.clone();
        let id = workflow_id.to_string();
        tokio::spawn(async move {
            let Err(e) = executor.mgmt.tasks().wait(task_id).await else {
                return;
            };
            let changed = executor
                .mgmt
                .workflows()
                .update(&id, |c| {
                    if c.status.is_terminal() || c.task_id != Some(task_id) {
                        return false;
                    }
                    c.status = if e.is_cancellation() {
                        WorkflowStatus::Cancelled
                    } else {
                        WorkflowStatus::Failed
                    };
                    c.error = Some(e.to_task_error());
                    true
                })
                .unwrap_or(false);
            if changed {
                info!(workflow_id = %id, error = %e, "Workflow ended by its task");
                let _ = executor.checkpoint(&id).await;
            }
        });
    }

    async fn checkpoint(&self, workflow_id: &str) -> Result<()> {
        let res = self.mgmt.workflows().checkpoint(&self.mgmt, workflow_id).await;
        if let Err(e) = &res {
            warn!(workflow_id, error = %e, "Failed to checkpoint workflow");
        }
        res
    }

    async fn run_steps(&self, id: &str, from: usize, task: TaskContext) -> Result<Value> {
        let initial = self.mgmt.workflows().require(id)?;
        let entity = self.mgmt.entities().require(&initial.entity_id)?;
        self.mgmt.workflows().update(id, |c| {
            c.status = WorkflowStatus::Running;
            c.task_id = Some(task.id());
        })?;
        self.checkpoint(id).await?;

        let mut index = from;
        loop {
            task.check_cancelled()?;
            let ctx = self.mgmt.workflows().require(id)?;
            if index >= ctx.steps.len() || ctx.output.is_some() {
                break;
            }
            let step = ctx.steps[index].clone();

            if let Some(condition) = &step.condition {
                let scope = scope_of(&ctx, &entity);
                match evaluate_condition(condition, &scope) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(workflow_id = id, step = index, "Condition false; skipping step");
                        self.record_skipped(id, index, &step)?;
                        self.checkpoint(id).await?;
                        index += 1;
                        continue;
                    }
                    Err(e) => return self.fail(id, index, &step, e).await,
                }
            }

            match self.run_step(&entity, &ctx, index, &step, &task).await {
                Ok(outcome) => {
                    let ends = outcome.ends_workflow;
                    self.record_completed(id, index, outcome)?;
                    self.checkpoint(id).await?;
                    if ends {
                        break;
                    }
                    index += 1;
                }
                Err(e) if e.is_cancellation() => {
                    self.mgmt.workflows().update(id, |c| {
                        c.status = WorkflowStatus::Cancelled;
                        c.error = Some(e.to_task_error());
                    })?;
                    let _ = self.checkpoint(id).await;
                    return Err(e);
                }
                Err(e) => return self.fail(id, index, &step, e).await,
            }
        }

        let ctx = self.mgmt.workflows().require(id)?;
        let output = match (&ctx.output, &ctx.output_template) {
            (Some(returned), _) => returned.clone(),
            (None, Some(template)) => resolve_value(template, &scope_of(&ctx, &entity))?,
            (None, None) => ctx.last_output.clone(),
        };
        let final_output = output.clone();
        self.mgmt.workflows().update(id, |c| {
            c.status = WorkflowStatus::Completed;
            c.output = Some(final_output);
            c.error = None;
        })?;
        self.checkpoint(id).await?;
        info!(workflow_id = id, entity_id = %entity.id(), "Workflow completed");
        Ok(output)
    }

    async fn run_step(
        &self,
        entity: &Arc<Entity>,
        ctx: &WorkflowExecutionContext,
        index: usize,
        step: &WorkflowStepDefinition,
        task: &TaskContext,
    ) -> Result<StepOutcome> {
        let scope = scope_of(ctx, entity);
        let resolved = resolve_kind(&step.kind, &scope).and_then(|kind| {
            step.validate()?;
            kind.validate()?;
            Ok(kind)
        });
        let input_value = match &resolved {
            Ok(kind) => serde_json::to_value(kind)?,
            Err(_) => serde_json::to_value(&step.kind)?,
        };
        let (kind, rejection) = match resolved {
            Ok(kind) => (Some(kind), None),
            Err(e) => (None, Some(e)),
        };

        let limit = step.timeout().ok().flatten();
        let retry_limit = step.retry.as_ref().map(|r| r.limit).unwrap_or(0);
        let retry_delay = step
            .retry
            .as_ref()
            .and_then(|r| r.delay().ok())
            .unwrap_or_default();
        let effects = Arc::new(StepEffects::default());
        let template = WorkflowStepInstanceExecutionContext {
            mgmt: self.mgmt.clone(),
            entity: entity.clone(),
            workflow: ctx.tag(),
            step_index: index,
            input: ctx.input.clone(),
            vars: ctx.vars.clone(),
            previous_output: ctx.last_output.clone(),
            task: task.clone(),
            effects: effects.clone(),
        };

        let executor = self.clone();
        let workflow_id = ctx.id.clone();
        let step_id = step.id.clone();
        let builder = TaskBuilder::new(step.display_name(index))
            .description(format!("Workflow {} step {}", ctx.id, index + 1))
            .tag(WORKFLOW_STEP_TAG)
            .tag(step_tag(&ctx.id, index))
            .tag(entity_tag(entity.id()))
            .validate(move || match rejection {
                Some(e) => Err(e),
                None => Ok(()),
            })
            .body(move |step_task| async move {
                let kind = kind.ok_or_else(|| {
                    EngineError::IllegalState("Step was not resolved".to_string())
                })?;
                executor
                    .record_started(&workflow_id, index, step_id, input_value, step_task.id())
                    .await?;
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    executor
                        .mgmt
                        .workflows()
                        .update(&workflow_id, |c| {
                            if let Some(r) = c.records.get_mut(&index) {
                                r.attempts += 1;
                            }
                        })?;
                    let mut sctx = template.clone();
                    sctx.task = step_task.clone();
                    let result = match limit {
                        Some(d) => timeout(d, kind.run(&sctx))
                            .await
                            .unwrap_or(Err(EngineError::Timeout(d))),
                        None => kind.run(&sctx).await,
                    };
                    match result {
                        Ok(v) => return Ok(v),
                        Err(e) if e.is_cancellation() || step_task.is_cancelled() => return Err(e),
                        Err(e) if attempt <= retry_limit => {
                            warn!(
                                workflow_id = %workflow_id,
                                step = index,
                                attempt,
                                error = %e,
                                "Step failed; retrying"
                            );
                            // effects of the failed attempt are discarded
                            sctx.effects.take_vars();
                            step_task.sleep(retry_delay).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
            });

        let handle = task.add_child(builder);
        let step_task_id = handle.id();
        self.mgmt.workflows().update(&ctx.id, |c| {
            c.current_step = Some(index);
            if let Some(r) = c.records.get_mut(&index) {
                r.task_id = Some(step_task_id);
            }
        })?;
        handle.submit().await?;
        let raw_output = task.wait_for(&handle).await?;

        let mut vars = ctx.vars.clone();
        vars.extend(effects.take_vars());
        let output = match &step.output {
            Some(template) => resolve_value(
                template,
                &Scope {
                    output: &raw_output,
                    input: &ctx.input,
                    vars: &vars,
                    entity: Some(entity),
                },
            )?,
            None => raw_output,
        };
        Ok(StepOutcome {
            output,
            vars,
            ends_workflow: effects.ends_workflow(),
            sub_workflows: effects.sub_workflows(),
        })
    }

    /// The durable "step started" mark, written before the step's behaviour runs.
    async fn record_started(
        &self,
        id: &str,
        index: usize,
        step_id: Option<String>,
        input: Value,
        task_id: TaskId,
    ) -> Result<()> {
        self.mgmt.workflows().update(id, |c| {
            let attempts = c.records.get(&index).map(|r| r.attempts).unwrap_or(0);
            let mut record = StepRecord::new(index, step_id, input);
            record.attempts = attempts;
            record.task_id = Some(task_id);
            record.started_at = Some(Utc::now());
            c.records.insert(index, record);
            c.current_step = Some(index);
        })?;
        debug!(workflow_id = id, step = index, "Step started");
        self.checkpoint(id).await
    }

    fn record_completed(&self, id: &str, index: usize, outcome: StepOutcome) -> Result<()> {
        self.mgmt.workflows().update(id, |c| {
            let record = c
                .records
                .entry(index)
                .or_insert_with(|| StepRecord::new(index, None, Value::Null));
            record.state = StepState::Completed;
            record.output = Some(outcome.output.clone());
            record.vars_after = Some(outcome.vars.clone());
            record.sub_workflows.extend(outcome.sub_workflows);
            record.ended_at = Some(Utc::now());
            c.vars = outcome.vars;
            c.last_output = outcome.output.clone();
            c.current_step = Some(index);
            if outcome.ends_workflow {
                c.output = Some(outcome.output);
            }
        })
    }

    fn record_skipped(&self, id: &str, index: usize, step: &WorkflowStepDefinition) -> Result<()> {
        let step_id = step.id.clone();
        self.mgmt.workflows().update(id, |c| {
            let mut record = StepRecord::new(index, step_id, Value::Null);
            record.state = StepState::Skipped;
            record.output = Some(c.last_output.clone());
            record.vars_after = Some(c.vars.clone());
            record.ended_at = Some(Utc::now());
            c.records.insert(index, record);
            c.current_step = Some(index);
        })
    }

    async fn fail(
        &self,
        id: &str,
        index: usize,
        step: &WorkflowStepDefinition,
        e: EngineError,
    ) -> Result<Value> {
        let cause = e.to_task_error();
        let step_id = step.id.clone();
        self.mgmt.workflows().update(id, |c| {
            let record = c
                .records
                .entry(index)
                .or_insert_with(|| StepRecord::new(index, step_id, Value::Null));
            record.state = StepState::Failed;
            record.error = Some(cause.clone());
            record.ended_at = Some(Utc::now());
            c.status = WorkflowStatus::Failed;
            c.error = Some(cause);
            c.current_step = Some(index);
        })?;
        warn!(workflow_id = id, step = index, error = %e, "Workflow failed");
        let _ = self.checkpoint(id).await;
        Err(e)
    }

    // --- replay ---

    fn ensure_not_running(&self, ctx: &WorkflowExecutionContext) -> Result<()> {
        let running = ctx
            .task_id
            .and_then(|t| self.mgmt.tasks().store().status(t))
            .is_some_and(|s| !s.is_terminal());
        if running {
            return Err(EngineError::IllegalState(format!(
                "Workflow {} is still running",
                ctx.id
            )));
        }
        Ok(())
    }

    /// Resumes at the last durably recorded boundary.
    ///
    /// A step that was interrupted mid-execution is re-run from scratch if it
    /// is idempotent; otherwise the workflow fails with `ReplayAmbiguous`.
    pub async fn replay_from_last(&self, workflow_id: &str) -> Result<WorkflowRun> {
        let ctx = self.mgmt.workflows().require(workflow_id)?;
        if ctx.status == WorkflowStatus::Completed {
            return Err(EngineError::IllegalState(format!(
                "Workflow {} has already completed",
                workflow_id
            )));
        }
        self.ensure_not_running(&ctx)?;

        let from = match ctx.records.values().next_back() {
            None => 0,
            Some(r) if r.is_boundary() => r.index + 1,
            Some(r) if r.state == StepState::Failed => r.index,
            Some(r) => {
                let idempotent = ctx.steps.get(r.index).is_some_and(|s| s.is_idempotent());
                if !idempotent {
                    return self.fail_ambiguous(&ctx, r.index).await;
                }
                r.index
            }
        };
        self.resume(&ctx, from).await
    }

    /// Operator-chosen restart point; state is taken from the boundary before `step`.
    pub async fn replay_from_step(&self, workflow_id: &str, step: usize) -> Result<WorkflowRun> {
        let ctx = self.mgmt.workflows().require(workflow_id)?;
        if step >= ctx.steps.len() {
            return Err(EngineError::IllegalArgument(format!(
                "Workflow {} has {} steps; cannot replay from step {}",
                workflow_id,
                ctx.steps.len(),
                step
            )));
        }
        self.ensure_not_running(&ctx)?;

        let (vars, last_output) = if step == 0 {
            (Map::new(), Value::Null)
        } else {
            match ctx.records.get(&(step - 1)) {
                Some(r) if r.is_boundary() => (
                    r.vars_after.clone().unwrap_or_default(),
                    r.output.clone().unwrap_or(Value::Null),
                ),
                _ => {
                    return Err(EngineError::IllegalState(format!(
                        "Workflow {} has no recorded boundary before step {}",
                        workflow_id, step
                    )));
                }
            }
        };
        self.mgmt.workflows().update(workflow_id, |c| {
            c.vars = vars;
            c.last_output = last_output;
        })?;
        let ctx = self.mgmt.workflows().require(workflow_id)?;
        self.resume(&ctx, step).await
    }

    async fn resume(&self, ctx: &WorkflowExecutionContext, from: usize) -> Result<WorkflowRun> {
        self.mgmt.workflows().update(&ctx.id, |c| {
            c.status = WorkflowStatus::Replaying { from_step: from };
            c.replay_count += 1;
            c.error = None;
            c.output = None;
            c.records.retain(|i, _| *i <= from);
        })?;
        info!(workflow_id = %ctx.id, from_step = from, "Replaying workflow");
        let ctx = self.mgmt.workflows().require(&ctx.id)?;
        self.launch(&ctx, from).await
    }

    async fn fail_ambiguous(
        &self,
        ctx: &WorkflowExecutionContext,
        index: usize,
    ) -> Result<WorkflowRun> {
        let reason = format!(
            "step {} was interrupted and is not idempotent",
            index + 1
        );
        let err = EngineError::ReplayAmbiguous {
            workflow: ctx.id.clone(),
            reason: reason.clone(),
        };
        let cause = err.to_task_error();
        self.mgmt.workflows().update(&ctx.id, |c| {
            c.status = WorkflowStatus::Failed;
            c.error = Some(cause);
        })?;
        warn!(workflow_id = %ctx.id, step = index, "Cannot replay workflow: {}", reason);
        let _ = self.checkpoint(&ctx.id).await;
        Err(err)
    }

    /// Workflows left unfinished by a restart, oldest first.
    pub fn interrupted(&self) -> Vec<WorkflowExecutionContext> {
        self.mgmt
            .workflows()
            .all()
            .into_iter()
            .filter(|c| !c.status.is_terminal() && c.status != WorkflowStatus::Created)
            .collect()
    }
}

fn scope_of<'a>(ctx: &'a WorkflowExecutionContext, entity: &'a Entity) -> Scope<'a> {
    Scope {
        output: &ctx.last_output,
        input: &ctx.input,
        vars: &ctx.vars,
        entity: Some(entity),
    }
}

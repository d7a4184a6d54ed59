use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, error, info, trace, warn};

use crate::duration::parse_duration;
use crate::error::{EngineError, Result};
use crate::runtime::effector::InvocationOptions;
use crate::runtime::invocation::effector_task;
use crate::workflow::context::WorkflowStepInstanceExecutionContext;
use crate::workflow::interpolate::{Scope, evaluate_value, resolve_value};
use crate::workflow::step::{StepBehavior, StepKind, apply_shorthand, require_text};

/// Config keys that stay text after interpolation.
const TEXT_FIELDS: &[&str] = &["message", "level", "variable", "sensor", "entity", "effector"];

/// Interpolates a step's config against the current scope.
///
/// Nested `workflow` steps are left alone; they resolve when they run.
pub fn resolve_kind(kind: &StepKind, scope: &Scope) -> Result<StepKind> {
    if matches!(kind, StepKind::Workflow { .. }) {
        return Ok(kind.clone());
    }
    let evaluates_value = matches!(
        kind,
        StepKind::Let { .. } | StepKind::Return { .. } | StepKind::SetSensor { .. }
    );
    let Value::Object(config) = serde_json::to_value(kind)? else {
        return Ok(kind.clone());
    };
    let mut resolved = Map::new();
    for (key, value) in config {
        let value = match key.as_str() {
            "type" => value,
            "value" if evaluates_value => evaluate_value(&value, scope)?,
            k if TEXT_FIELDS.contains(&k) => match resolve_value(&value, scope)? {
                Value::String(s) => Value::String(s),
                Value::Null => Value::Null,
                other => Value::String(other.to_string()),
            },
            _ => resolve_value(&value, scope)?,
        };
        resolved.insert(key, value);
    }
    Ok(serde_json::from_value(Value::Object(resolved))?)
}

fn parse_sleep(duration: &Option<Value>) -> Result<Duration> {
    match duration {
        Some(Value::String(s)) => parse_duration(s),
        Some(Value::Number(n)) => n.as_u64().map(Duration::from_millis).ok_or_else(|| {
            EngineError::IllegalArgument(format!("Invalid sleep duration {}", n))
        }),
        Some(other) => Err(EngineError::IllegalArgument(format!(
            "Invalid sleep duration {}",
            other
        ))),
        None => Err(EngineError::IllegalArgument(
            "Step 'sleep' requires a 'duration'".to_string(),
        )),
    }
}

#[async_trait]
impl StepBehavior for StepKind {
    fn populate_from_shorthand(&mut self, value: &str) -> Result<()> {
        apply_shorthand(self, value)
    }

    fn validate(&self) -> Result<()> {
        match self {
            StepKind::Log { message, .. } => require_text(message, "log", "message"),
            StepKind::Sleep { duration } => parse_sleep(duration).map(|_| ()),
            StepKind::Let { variable, .. } => require_text(variable, "let", "variable"),
            StepKind::SetSensor { sensor, .. } => require_text(sensor, "set-sensor", "sensor"),
            StepKind::InvokeEffector { effector, .. } => {
                require_text(effector, "invoke-effector", "effector")
            }
            StepKind::Workflow { steps } if steps.is_empty() => Err(EngineError::IllegalArgument(
                "Step 'workflow' requires at least one step".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn is_idempotent_by_default(&self) -> bool {
        match self {
            StepKind::InvokeEffector { .. } => false,
            StepKind::Workflow { steps } => steps.iter().all(|s| s.is_idempotent()),
            _ => true,
        }
    }

    async fn run(&self, ctx: &WorkflowStepInstanceExecutionContext) -> Result<Value> {
        let workflow_id = ctx.workflow.workflow_id.as_str();
        let step = ctx.step_index;
        match self {
            StepKind::Log { message, level } => {
                let message = message.as_deref().unwrap_or_default();
                match level.as_deref().unwrap_or("info") {
                    "trace" => trace!(workflow_id, step, "{}", message),
                    "debug" => debug!(workflow_id, step, "{}", message),
                    "warn" => warn!(workflow_id, step, "{}", message),
                    "error" => error!(workflow_id, step, "{}", message),
                    _ => info!(workflow_id, step, "{}", message),
                }
                Ok(ctx.previous_output())
            }
            StepKind::Sleep { duration } => {
                let d = parse_sleep(duration)?;
                debug!(workflow_id, step, duration = ?d, "Sleeping");
                ctx.task.sleep(d).await?;
                Ok(ctx.previous_output())
            }
            StepKind::NoOp {} => Ok(ctx.previous_output()),
            StepKind::Let { variable, value } => {
                if let Some(name) = variable {
                    ctx.set_var(name.clone(), value.clone().unwrap_or(Value::Null));
                }
                Ok(ctx.previous_output())
            }
            StepKind::SetSensor {
                sensor,
                value,
                entity,
            } => {
                let target = match entity {
                    Some(id) => ctx.mgmt.entities().require(id)?,
                    None => ctx.entity.clone(),
                };
                if let Some(name) = sensor {
                    target.set_sensor(name, value.clone().unwrap_or(Value::Null));
                }
                Ok(ctx.previous_output())
            }
            StepKind::Return { value } => {
                ctx.end_workflow();
                Ok(value.clone().unwrap_or_else(|| ctx.previous_output()))
            }
            StepKind::Fail { message } => Err(EngineError::Execution(
                message
                    .clone()
                    .unwrap_or_else(|| format!("Workflow failed at step {}", step + 1)),
            )),
            StepKind::InvokeEffector {
                effector,
                entity,
                args,
            } => {
                let target = match entity {
                    Some(id) => ctx.mgmt.entities().require(id)?,
                    None => ctx.entity.clone(),
                };
                let name = effector.as_deref().unwrap_or_default();
                let effector = target
                    .effector(name)
                    .ok_or_else(|| EngineError::not_found("Effector", name))?;
                let effects = ctx.effects.clone();
                let options = InvocationOptions::from_workflow(ctx.tag(), move |child| {
                    effects.push_sub_workflow(child)
                });
                let builder = effector_task(&ctx.mgmt, &target, &effector, args.clone(), options)?;
                ctx.task.run_child(builder).await
            }
            StepKind::Workflow { steps } => {
                ctx.mgmt
                    .workflow_executor()
                    .run_nested(ctx, steps.clone())
                    .await
            }
        }
    }
}

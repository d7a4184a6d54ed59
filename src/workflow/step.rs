use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::duration::parse_duration;
use crate::error::{EngineError, Result};
use crate::workflow::context::WorkflowStepInstanceExecutionContext;
use crate::workflow::shorthand::ShorthandTemplate;

/// 步骤类型：封闭的变体集合，每个变体携带自己的配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepKind {
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<String>,
    },
    Sleep {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<Value>,
    },
    NoOp {},
    Let {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variable: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    SetSensor {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sensor: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
    },
    Return {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    Fail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    InvokeEffector {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        effector: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        args: Map<String, Value>,
    },
    Workflow {
        #[serde(default)]
        steps: Vec<WorkflowStepDefinition>,
    },
}

impl StepKind {
    pub fn discriminator(&self) -> &'static str {
        match self {
            StepKind::Log { .. } => "log",
            StepKind::Sleep { .. } => "sleep",
            StepKind::NoOp {} => "no-op",
            StepKind::Let { .. } => "let",
            StepKind::SetSensor { .. } => "set-sensor",
            StepKind::Return { .. } => "return",
            StepKind::Fail { .. } => "fail",
            StepKind::InvokeEffector { .. } => "invoke-effector",
            StepKind::Workflow { .. } => "workflow",
        }
    }

    /// An empty instance of the kind registered under `discriminator`.
    pub fn empty(discriminator: &str) -> Option<StepKind> {
        Some(match discriminator {
            "log" => StepKind::Log {
                message: None,
                level: None,
            },
            "sleep" => StepKind::Sleep { duration: None },
            "no-op" => StepKind::NoOp {},
            "let" => StepKind::Let {
                variable: None,
                value: None,
            },
            "set-sensor" => StepKind::SetSensor {
                sensor: None,
                value: None,
                entity: None,
            },
            "return" => StepKind::Return { value: None },
            "fail" => StepKind::Fail { message: None },
            "invoke-effector" => StepKind::InvokeEffector {
                effector: None,
                entity: None,
                args: Map::new(),
            },
            "workflow" => StepKind::Workflow { steps: Vec::new() },
            _ => return None,
        })
    }

    pub fn shorthand_template(&self) -> Option<&'static str> {
        match self {
            StepKind::Log { .. } => Some("${message...}"),
            StepKind::Sleep { .. } => Some("${duration}"),
            StepKind::NoOp {} => Some(""),
            StepKind::Let { .. } => Some("${variable} [ \"=\" ${value...} ]"),
            StepKind::SetSensor { .. } => Some("${sensor} [ \"=\" ${value...} ]"),
            StepKind::Return { .. } => Some("[ ${value...} ]"),
            StepKind::Fail { .. } => Some("[ ${message...} ]"),
            StepKind::InvokeEffector { .. } => Some("${effector} [ \"on\" ${entity} ]"),
            StepKind::Workflow { .. } => None,
        }
    }
}

/// Capability interface every step kind offers to the executor.
#[async_trait]
pub trait StepBehavior: Send + Sync {
    /// Parses a positional shorthand string into this step's config fields.
    fn populate_from_shorthand(&mut self, value: &str) -> Result<()>;

    /// Rejects missing or malformed config; called before the step is marked started.
    fn validate(&self) -> Result<()>;

    fn is_idempotent_by_default(&self) -> bool;

    /// Runs the step. Steps with nothing to produce return the previous output.
    async fn run(&self, ctx: &WorkflowStepInstanceExecutionContext) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
}

impl RetryPolicy {
    pub fn delay(&self) -> Result<Duration> {
        self.delay
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map(|d| d.unwrap_or(Duration::ZERO))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl WorkflowStepDefinition {
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: None,
            name: None,
            kind,
            condition: None,
            idempotent: None,
            timeout: None,
            retry: None,
            output: None,
        }
    }

    /// Explicit configuration wins over the kind's default.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
            .unwrap_or_else(|| self.kind.is_idempotent_by_default())
    }

    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }

    pub fn display_name(&self, index: usize) -> String {
        match (&self.name, &self.id) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => format!("{} ({})", id, self.kind.discriminator()),
            (None, None) => format!("{}-{}", index + 1, self.kind.discriminator()),
        }
    }

    /// Checks the step-level fields. The kind's own config may hold `${...}`
    /// references and is checked once resolved.
    pub fn validate(&self) -> Result<()> {
        self.timeout()?;
        if let Some(retry) = &self.retry {
            retry.delay()?;
        }
        Ok(())
    }
}

impl From<StepKind> for WorkflowStepDefinition {
    fn from(kind: StepKind) -> Self {
        Self::new(kind)
    }
}

pub(crate) fn apply_shorthand(kind: &mut StepKind, value: &str) -> Result<()> {
    let Some(template) = kind.shorthand_template() else {
        return Err(EngineError::IllegalArgument(format!(
            "Step type '{}' does not accept shorthand",
            kind.discriminator()
        )));
    };
    let captured = ShorthandTemplate::parse(template)?.apply(value)?;
    let text = |key: &str| captured.get(key).cloned();
    let val = |key: &str| captured.get(key).cloned().map(Value::String);

    match kind {
        StepKind::Log { message, .. } => *message = text("message"),
        StepKind::Sleep { duration } => *duration = val("duration"),
        StepKind::NoOp {} => {}
        StepKind::Let { variable, value } => {
            *variable = text("variable");
            *value = val("value");
        }
        StepKind::SetSensor { sensor, value, .. } => {
            *sensor = text("sensor");
            *value = val("value");
        }
        StepKind::Return { value } => *value = val("value"),
        StepKind::Fail { message } => *message = text("message"),
        StepKind::InvokeEffector {
            effector, entity, ..
        } => {
            *effector = text("effector");
            *entity = text("entity");
        }
        StepKind::Workflow { .. } => {}
    }
    Ok(())
}

pub(crate) fn require_text(field: &Option<String>, step: &str, name: &str) -> Result<()> {
    match field {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(EngineError::IllegalArgument(format!(
            "Step '{}' requires a non-blank '{}'",
            step, name
        ))),
    }
}

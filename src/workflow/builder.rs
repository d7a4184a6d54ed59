use serde_json::{Map, Value};

use crate::workflow::WorkflowDefinition;
use crate::workflow::step::{RetryPolicy, StepKind, WorkflowStepDefinition};

pub struct WorkflowBuilder {
    name: String,
    pub steps: Vec<WorkflowStepDefinition>,
    output: Option<Value>,
}

impl WorkflowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
            output: None,
        }
    }

    pub fn output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Starts a step whose common fields can be set before `build()`.
    pub fn step(self, kind: StepKind) -> StepBuilder {
        StepBuilder {
            workflow_builder: self,
            definition: WorkflowStepDefinition::new(kind),
        }
    }

    pub fn push(mut self, definition: WorkflowStepDefinition) -> Self {
        self.steps.push(definition);
        self
    }

    pub fn log(self, message: &str) -> Self {
        self.step(StepKind::Log {
            message: Some(message.to_string()),
            level: None,
        })
        .build()
    }

    pub fn sleep(self, duration: &str) -> Self {
        self.step(StepKind::Sleep {
            duration: Some(Value::String(duration.to_string())),
        })
        .build()
    }

    pub fn no_op(self) -> Self {
        self.step(StepKind::NoOp {}).build()
    }

    pub fn let_var(self, variable: &str, value: impl Into<Value>) -> Self {
        self.step(StepKind::Let {
            variable: Some(variable.to_string()),
            value: Some(value.into()),
        })
        .build()
    }

    pub fn set_sensor(self, sensor: &str, value: impl Into<Value>) -> Self {
        self.step(StepKind::SetSensor {
            sensor: Some(sensor.to_string()),
            value: Some(value.into()),
            entity: None,
        })
        .build()
    }

    pub fn invoke(self, effector: &str) -> Self {
        self.invoke_with(effector, Map::new())
    }

    pub fn invoke_with(self, effector: &str, args: Map<String, Value>) -> Self {
        self.step(StepKind::InvokeEffector {
            effector: Some(effector.to_string()),
            entity: None,
            args,
        })
        .build()
    }

    pub fn return_value(self, value: impl Into<Value>) -> Self {
        self.step(StepKind::Return {
            value: Some(value.into()),
        })
        .build()
    }

    pub fn fail(self, message: &str) -> Self {
        self.step(StepKind::Fail {
            message: Some(message.to_string()),
        })
        .build()
    }

    pub fn build(self) -> WorkflowDefinition {
        WorkflowDefinition {
            name: self.name,
            steps: self.steps,
            output: self.output,
        }
    }
}

pub struct StepBuilder {
    workflow_builder: WorkflowBuilder,
    definition: WorkflowStepDefinition,
}

impl StepBuilder {
    pub fn id(mut self, id: &str) -> Self {
        self.definition.id = Some(id.to_string());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.definition.name = Some(name.to_string());
        self
    }

    pub fn condition(mut self, condition: &str) -> Self {
        self.definition.condition = Some(condition.to_string());
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.definition.idempotent = Some(idempotent);
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.definition.timeout = Some(timeout.to_string());
        self
    }

    pub fn retry(mut self, limit: u32, delay: Option<&str>) -> Self {
        self.definition.retry = Some(RetryPolicy {
            limit,
            delay: delay.map(str::to_string),
        });
        self
    }

    pub fn output(mut self, output: impl Into<Value>) -> Self {
        self.definition.output = Some(output.into());
        self
    }

    pub fn build(mut self) -> WorkflowBuilder {
        self.workflow_builder.steps.push(self.definition);
        self.workflow_builder
    }
}

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::duration::parse_duration;
use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::management::ManagementContext;
use crate::runtime::context::TaskContext;
use crate::workflow::context::WorkflowTag;

/// 效应器参数声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterType {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl ParameterType {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            default: None,
            description: None,
            required: false,
        }
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Coerces a supplied value to the declared type. Strings are accepted
    /// for scalar types, as they arrive that way from the REST and CLI boundary.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        let mismatch = |v: &Value| {
            EngineError::IllegalArgument(format!(
                "Parameter '{}' expects {}, got {}",
                self.name, self.type_name, v
            ))
        };
        match (self.type_name.as_str(), value) {
            (_, Value::Null) => Ok(Value::Null),
            ("string", Value::String(s)) => Ok(Value::String(s)),
            ("string", v) => Ok(Value::String(match v {
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => other.to_string(),
            })),
            ("integer" | "long" | "int", Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Ok(Value::Number(n))
            }
            ("integer" | "long" | "int", Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| mismatch(&Value::String(s))),
            ("number" | "double" | "float", Value::Number(n)) => Ok(Value::Number(n)),
            ("number" | "double" | "float", Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch(&Value::String(s))),
            ("boolean" | "bool", Value::Bool(b)) => Ok(Value::Bool(b)),
            ("boolean" | "bool", Value::String(s)) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&Value::String(s))),
            },
            ("duration", Value::String(s)) => {
                parse_duration(&s)?;
                Ok(Value::String(s))
            }
            ("duration", Value::Number(n)) => Ok(Value::Number(n)),
            ("map", Value::Object(m)) => Ok(Value::Object(m)),
            ("list", Value::Array(a)) => Ok(Value::Array(a)),
            ("json" | "object" | "any", v) => Ok(v),
            (_, v) => {
                if matches!(self.type_name.as_str(), "integer" | "long" | "int" | "number" | "double" | "float" | "boolean" | "bool" | "duration" | "map" | "list") {
                    Err(mismatch(&v))
                } else {
                    // unknown declared types are opaque to the engine
                    Ok(v)
                }
            }
        }
    }
}

/// Extra context when an effector is invoked from inside a workflow step.
#[derive(Clone, Default)]
pub struct InvocationOptions {
    pub parent_workflow: Option<WorkflowTag>,
    pub on_sub_workflow: Option<Arc<dyn Fn(WorkflowTag) + Send + Sync>>,
}

impl InvocationOptions {
    pub fn from_workflow(
        parent: WorkflowTag,
        on_sub_workflow: impl Fn(WorkflowTag) + Send + Sync + 'static,
    ) -> Self {
        Self {
            parent_workflow: Some(parent),
            on_sub_workflow: Some(Arc::new(on_sub_workflow)),
        }
    }
}

pub struct EffectorInvocation {
    pub mgmt: ManagementContext,
    pub entity: Arc<Entity>,
    pub effector: Arc<Effector>,
    pub params: Map<String, Value>,
    pub task: TaskContext,
    pub options: InvocationOptions,
}

impl EffectorInvocation {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// 效应器实现 (body)
#[async_trait]
pub trait EffectorBody: Send + Sync + Debug {
    async fn call(&self, invocation: EffectorInvocation) -> Result<Value>;

    /// Workflow bodies get sub-workflow linkage recorded on their tasks.
    fn is_workflow(&self) -> bool {
        false
    }
}

type EffectorFn = dyn Fn(EffectorInvocation) -> BoxFuture<'static, Result<Value>> + Send + Sync;

pub struct FnEffectorBody {
    f: Box<EffectorFn>,
}

impl Debug for FnEffectorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnEffectorBody")
    }
}

#[async_trait]
impl EffectorBody for FnEffectorBody {
    async fn call(&self, invocation: EffectorInvocation) -> Result<Value> {
        (self.f)(invocation).await
    }
}

/// 效应器：不可变签名 + 可选实现
#[derive(Clone)]
pub struct Effector {
    name: String,
    description: Option<String>,
    return_type: String,
    parameters: Vec<ParameterType>,
    body: Option<Arc<dyn EffectorBody>>,
}

impl Debug for Effector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effector")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .field("parameters", &self.parameters)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

impl Effector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            return_type: "void".to_string(),
            parameters: Vec::new(),
            body: None,
        }
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(EffectorInvocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(name).with_body(Arc::new(FnEffectorBody {
            f: Box::new(move |inv| Box::pin(f(inv))),
        }))
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn returns(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = return_type.into();
        self
    }

    pub fn parameter(mut self, parameter: ParameterType) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_body(mut self, body: Arc<dyn EffectorBody>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description_text(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn return_type(&self) -> &str {
        &self.return_type
    }

    pub fn parameters(&self) -> &[ParameterType] {
        &self.parameters
    }

    pub fn body(&self) -> Option<Arc<dyn EffectorBody>> {
        self.body.clone()
    }

    pub fn is_workflow(&self) -> bool {
        self.body.as_ref().is_some_and(|b| b.is_workflow())
    }

    /// Name, parameters and return type match; the body is not compared.
    pub fn same_signature(&self, other: &Effector) -> bool {
        self.name == other.name
            && self.return_type == other.return_type
            && self.parameters == other.parameters
    }

    pub fn same_instance(a: &Arc<Effector>, b: &Arc<Effector>) -> bool {
        Arc::ptr_eq(a, b)
    }

    /// Applies declared defaults and coercion. Undeclared parameters pass through.
    pub fn resolve_parameters(&self, mut provided: Map<String, Value>) -> Result<Map<String, Value>> {
        let mut resolved = Map::new();
        for p in &self.parameters {
            match provided.remove(&p.name) {
                Some(v) => {
                    resolved.insert(p.name.clone(), p.coerce(v)?);
                }
                None => match &p.default {
                    Some(d) => {
                        resolved.insert(p.name.clone(), d.clone());
                    }
                    None if p.required => {
                        return Err(EngineError::IllegalArgument(format!(
                            "Missing required parameter '{}' for effector {}",
                            p.name, self.name
                        )));
                    }
                    None => {}
                },
            }
        }
        resolved.extend(provided);
        Ok(resolved)
    }
}

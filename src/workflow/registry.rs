use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::workflow::step::{StepBehavior, StepKind, WorkflowStepDefinition};

const BUILTIN_STEPS: &[&str] = &[
    "log",
    "sleep",
    "no-op",
    "let",
    "set-sensor",
    "return",
    "fail",
    "invoke-effector",
    "workflow",
];

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("noop", "no-op"),
    ("set-variable", "let"),
    ("effector", "invoke-effector"),
    ("invoke", "invoke-effector"),
    ("subworkflow", "workflow"),
];

/// 步骤类型注册表：字符串判别符 → 步骤类型
///
/// Owned by the management context and cleared when it shuts down.
#[derive(Default)]
pub struct StepRegistry {
    types: DashMap<String, String>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        for name in BUILTIN_STEPS {
            registry.types.insert(name.to_string(), name.to_string());
        }
        for (alias, target) in BUILTIN_ALIASES {
            registry.register_alias(alias, target)?;
        }
        Ok(registry)
    }

    /// Registers another discriminator for an existing step type.
    pub fn register_alias(&self, alias: &str, target: &str) -> Result<()> {
        let canonical = self.resolve(target).ok_or_else(|| {
            EngineError::IllegalArgument(format!("Unknown step type '{}'", target))
        })?;
        self.types.insert(alias.to_string(), canonical);
        Ok(())
    }

    pub fn resolve(&self, discriminator: &str) -> Option<String> {
        self.types.get(discriminator).map(|t| t.value().clone())
    }

    pub fn is_registered(&self, discriminator: &str) -> bool {
        self.types.contains_key(discriminator)
    }

    pub fn discriminators(&self) -> Vec<String> {
        let mut all: Vec<_> = self.types.iter().map(|e| e.key().clone()).collect();
        all.sort();
        all
    }

    pub fn clear(&self) {
        self.types.clear();
    }

    fn empty_kind(&self, discriminator: &str) -> Result<StepKind> {
        self.resolve(discriminator)
            .and_then(|canonical| StepKind::empty(&canonical))
            .ok_or_else(|| {
                EngineError::IllegalArgument(format!("Unknown step type '{}'", discriminator))
            })
    }

    /// Parses `"<type> <shorthand...>"`, e.g. `"sleep 50ms"`.
    pub fn parse_shorthand(&self, line: &str) -> Result<StepKind> {
        let line = line.trim();
        let (discriminator, rest) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));
        let mut kind = self.empty_kind(discriminator)?;
        kind.populate_from_shorthand(rest.trim())?;
        Ok(kind)
    }

    /// Accepts a shorthand string, a map with `step:` (shorthand plus
    /// explicit overrides) or a map with `type:` and explicit keys.
    pub fn parse_step(&self, raw: &Value) -> Result<WorkflowStepDefinition> {
        let normalized = self.normalize(raw)?;
        serde_json::from_value(normalized).map_err(|e| {
            EngineError::IllegalArgument(format!("Invalid step definition {}: {}", raw, e))
        })
    }

    pub fn parse_steps(&self, raw: &[Value]) -> Result<Vec<WorkflowStepDefinition>> {
        raw.iter().map(|s| self.parse_step(s)).collect()
    }

    fn normalize(&self, raw: &Value) -> Result<Value> {
        match raw {
            Value::String(line) => Ok(serde_json::to_value(self.parse_shorthand(line)?)?),
            Value::Object(map) => {
                let mut out = match (map.get("step"), map.get("type")) {
                    (Some(Value::String(line)), _) => match serde_json::to_value(self.parse_shorthand(line)?)? {
                        Value::Object(base) => base,
                        _ => Map::new(),
                    },
                    (None, Some(Value::String(t))) => {
                        let canonical = self.resolve(t).ok_or_else(|| {
                            EngineError::IllegalArgument(format!("Unknown step type '{}'", t))
                        })?;
                        let mut base = Map::new();
                        base.insert("type".to_string(), Value::String(canonical));
                        base
                    }
                    _ => {
                        return Err(EngineError::IllegalArgument(format!(
                            "Step {} needs 'step' or 'type'",
                            raw
                        )));
                    }
                };
                for (k, v) in map {
                    if k == "step" || k == "type" {
                        continue;
                    }
                    if k == "steps" {
                        if let Value::Array(nested) = v {
                            let nested = nested
                                .iter()
                                .map(|s| self.normalize(s))
                                .collect::<Result<Vec<_>>>()?;
                            out.insert(k.clone(), Value::Array(nested));
                            continue;
                        }
                    }
                    out.insert(k.clone(), v.clone());
                }
                Ok(Value::Object(out))
            }
            other => Err(EngineError::IllegalArgument(format!(
                "Step definition must be a string or a map, got {}",
                other
            ))),
        }
    }
}

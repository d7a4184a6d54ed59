//! `${...}` resolution in step config, and expression evaluation.

use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, eval_with_context};
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::entity::Entity;
use crate::error::{EngineError, Result};

const REFERENCE: &str = r"\$\{([^}]+)\}";

/// What a step's `${...}` references resolve against.
pub struct Scope<'a> {
    pub output: &'a Value,
    pub input: &'a Map<String, Value>,
    pub vars: &'a Map<String, Value>,
    pub entity: Option<&'a Entity>,
}

impl Scope<'_> {
    /// `output[.path]`, `input.NAME`, `vars.NAME`, `sensor.NAME`, `entity.id`,
    /// or a bare name looked up in vars, then input.
    pub fn lookup(&self, reference: &str) -> Result<Value> {
        let reference = reference.trim();
        let (head, rest) = match reference.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (reference, None),
        };
        let found = match (head, rest) {
            ("output", None) => Some(self.output.clone()),
            ("output", Some(path)) => walk(self.output, path),
            ("input", Some(path)) => lookup_path(self.input, path),
            ("vars", Some(path)) => lookup_path(self.vars, path),
            // sensor names may themselves contain dots
            ("sensor", Some(name)) => self.entity.and_then(|e| e.sensor(name)),
            ("entity", Some(field)) => self.entity.and_then(|e| match field {
                "id" => Some(Value::String(e.id().to_string())),
                "name" | "displayName" => Some(Value::String(e.display_name().to_string())),
                "type" => Some(Value::String(e.type_name().to_string())),
                _ => None,
            }),
            _ => lookup_path(self.vars, reference).or_else(|| lookup_path(self.input, reference)),
        };
        found.ok_or_else(|| {
            EngineError::IllegalArgument(format!("Cannot resolve '${{{}}}'", reference))
        })
    }

    fn eval_context(&self) -> HashMapContext<DefaultNumericTypes> {
        let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
        for (k, v) in self.input.iter().chain(self.vars.iter()) {
            if let Some(ev) = to_eval(v) {
                let _ = ctx.set_value(k.clone(), ev);
            }
        }
        ctx
    }
}

fn lookup_path(map: &Map<String, Value>, path: &str) -> Option<Value> {
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, Some(r)),
        None => (path, None),
    };
    let value = map.get(head)?;
    match rest {
        Some(r) => walk(value, r),
        None => Some(value.clone()),
    }
}

fn walk(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn reference_regex() -> Result<Regex> {
    Regex::new(REFERENCE).map_err(|e| EngineError::Expression(e.to_string()))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A string that is exactly one `${...}` keeps the referenced value's type;
/// anything else is rendered as text.
pub fn resolve_string(s: &str, scope: &Scope) -> Result<Value> {
    let re = reference_regex()?;
    if let Some(caps) = re.captures(s) {
        if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
            return scope.lookup(&caps[1]);
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&s[last..m.start()]);
        out.push_str(&render(&scope.lookup(&caps[1])?));
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

pub fn resolve_value(value: &Value, scope: &Scope) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, scope))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Renders references as expression literals so strings stay quoted.
fn resolve_expression(expr: &str, scope: &Scope) -> Result<String> {
    let re = reference_regex()?;
    let mut out = String::with_capacity(expr.len());
    let mut last = 0;
    for caps in re.captures_iter(expr) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&expr[last..m.start()]);
        out.push_str(&literal(&scope.lookup(&caps[1])?));
        last = m.end();
    }
    out.push_str(&expr[last..]);
    Ok(out)
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Value::Null => "()".to_string(),
        other => other.to_string(),
    }
}

/// Step conditions: an evalexpr boolean over the workflow's inputs and variables.
pub fn evaluate_condition(expr: &str, scope: &Scope) -> Result<bool> {
    let source = resolve_expression(expr, scope)?;
    match eval_with_context(&source, &scope.eval_context()) {
        Ok(evalexpr::Value::Boolean(b)) => Ok(b),
        Ok(other) => Err(EngineError::Expression(format!(
            "Condition '{}' is not boolean: {:?}",
            expr, other
        ))),
        Err(e) => Err(EngineError::Expression(format!(
            "Condition '{}' failed: {}",
            expr, e
        ))),
    }
}

/// Resolves a `let`/`return`/`set-sensor` value. String values are tried as an
/// expression (`${input.a} + 1`, `true`, `42`) and kept as text if that fails.
pub fn evaluate_value(value: &Value, scope: &Scope) -> Result<Value> {
    let Value::String(s) = value else {
        return resolve_value(value, scope);
    };
    let source = resolve_expression(s, scope)?;
    match eval_with_context(&source, &scope.eval_context()) {
        Ok(result) => Ok(from_eval(result).unwrap_or_else(|| Value::String(source.clone()))),
        Err(_) => resolve_string(s, scope),
    }
}

fn to_eval(v: &Value) -> Option<evalexpr::Value<DefaultNumericTypes>> {
    match v {
        Value::String(s) => Some(evalexpr::Value::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(evalexpr::Value::Int(i))
            } else {
                n.as_f64().map(evalexpr::Value::Float)
            }
        }
        Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
        _ => None,
    }
}

fn from_eval(v: evalexpr::Value<DefaultNumericTypes>) -> Option<Value> {
    match v {
        evalexpr::Value::String(s) => Some(Value::String(s)),
        evalexpr::Value::Int(i) => Some(json!(i)),
        evalexpr::Value::Float(f) => Some(json!(f)),
        evalexpr::Value::Boolean(b) => Some(Value::Bool(b)),
        evalexpr::Value::Empty => Some(Value::Null),
        _ => None,
    }
}

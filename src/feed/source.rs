use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::process::Command;

use crate::error::{EngineError, Result};
use crate::feed::http::HttpPoll;

/// Outcome of one sample. `Failure` means the source answered but reported
/// a problem (non-2xx, non-zero exit); an `Err` is an exception.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    Success(Value),
    Failure(Value),
}

pub type PollFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// 采样来源 (closed set)
#[derive(Clone)]
pub enum PollSource {
    /// In-process closure. Not persistable; the entity's initializer
    /// recreates it on rebind.
    Function { name: String, f: PollFn },
    Http(HttpPoll),
    Command(CommandPoll),
}

impl fmt::Debug for PollSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollSource::Function { name, .. } => write!(f, "Function({})", name),
            PollSource::Http(h) => write!(f, "Http({} {})", h.method, h.url),
            PollSource::Command(c) => write!(f, "Command({})", c.command),
        }
    }
}

impl PollSource {
    pub fn function<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        PollSource::Function {
            name: name.into(),
            f: Arc::new(move || Box::pin(f())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PollSource::Function { .. } => "FunctionFeed",
            PollSource::Http(_) => "HttpFeed",
            PollSource::Command(_) => "CommandFeed",
        }
    }

    /// Stable text identifying what is sampled; part of the default feed tag.
    pub fn describe(&self) -> String {
        match self {
            PollSource::Function { name, .. } => name.clone(),
            PollSource::Http(h) => h.url.clone(),
            PollSource::Command(c) => c.command_line(),
        }
    }

    pub async fn sample(&self) -> Result<PollResult> {
        match self {
            PollSource::Function { f, .. } => f().await.map(PollResult::Success),
            PollSource::Http(h) => h.sample().await,
            PollSource::Command(c) => c.sample().await,
        }
    }

    pub fn to_spec(&self) -> SourceSpec {
        match self {
            PollSource::Function { name, .. } => SourceSpec::Function { name: name.clone() },
            PollSource::Http(h) => SourceSpec::Http {
                url: h.url.clone(),
                method: h.method.clone(),
                headers: h.headers.clone(),
                body: h.body.clone(),
            },
            PollSource::Command(c) => SourceSpec::Command {
                command: c.command.clone(),
                args: c.args.clone(),
            },
        }
    }
}

/// Runs a local process; stdout is the sample when it exits 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPoll {
    pub command: String,
    pub args: Vec<String>,
}

impl CommandPoll {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn sample(&self) -> Result<PollResult> {
        let output = Command::new(&self.command)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                EngineError::Execution(format!("Failed to run '{}': {}", self.command_line(), e))
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok(PollResult::Success(Value::String(stdout)))
        } else {
            Ok(PollResult::Failure(json!({
                "exitCode": output.status.code(),
                "stdout": stdout,
                "stderr": String::from_utf8_lossy(&output.stderr).trim(),
            })))
        }
    }
}

/// How a successful sample becomes a sensor value.
#[derive(Clone, Default)]
pub enum ValueMapping {
    #[default]
    Identity,
    /// RFC 6901 pointer into a JSON sample; a string sample is parsed first.
    Pointer(String),
    Constant(Value),
    Custom {
        name: String,
        f: Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>,
    },
}

impl fmt::Debug for ValueMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueMapping::Identity => f.write_str("Identity"),
            ValueMapping::Pointer(p) => write!(f, "Pointer({})", p),
            ValueMapping::Constant(v) => write!(f, "Constant({})", v),
            ValueMapping::Custom { name, .. } => write!(f, "Custom({})", name),
        }
    }
}

impl ValueMapping {
    pub fn apply(&self, sample: Value) -> Result<Value> {
        match self {
            ValueMapping::Identity => Ok(sample),
            ValueMapping::Pointer(pointer) => {
                let doc = match sample {
                    Value::String(s) => serde_json::from_str(&s)?,
                    other => other,
                };
                doc.pointer(pointer).cloned().ok_or_else(|| {
                    EngineError::Execution(format!("No value at '{}' in sample", pointer))
                })
            }
            ValueMapping::Constant(v) => Ok(v.clone()),
            ValueMapping::Custom { f, .. } => f(sample),
        }
    }

    pub fn to_spec(&self) -> MappingSpec {
        match self {
            ValueMapping::Identity => MappingSpec::Identity,
            ValueMapping::Pointer(p) => MappingSpec::Pointer { pointer: p.clone() },
            ValueMapping::Constant(v) => MappingSpec::Constant { value: v.clone() },
            ValueMapping::Custom { name, .. } => MappingSpec::Custom { name: name.clone() },
        }
    }
}

/// One sensor fed by one source.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub sensor: String,
    pub source: PollSource,
    pub period: Option<Duration>,
    pub timeout: Option<Duration>,
    pub on_success: ValueMapping,
    pub on_failure: Option<Value>,
    pub on_exception: Option<Value>,
    pub suppress_duplicates: bool,
}

impl PollConfig {
    pub fn new(sensor: impl Into<String>, source: PollSource) -> Self {
        Self {
            sensor: sensor.into(),
            source,
            period: None,
            timeout: None,
            on_success: ValueMapping::Identity,
            on_failure: None,
            on_exception: None,
            suppress_duplicates: false,
        }
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_success(mut self, mapping: ValueMapping) -> Self {
        self.on_success = mapping;
        self
    }

    pub fn on_failure(mut self, value: impl Into<Value>) -> Self {
        self.on_failure = Some(value.into());
        self
    }

    pub fn on_exception(mut self, value: impl Into<Value>) -> Self {
        self.on_exception = Some(value.into());
        self
    }

    pub fn suppress_duplicates(mut self, suppress: bool) -> Self {
        self.suppress_duplicates = suppress;
        self
    }

    pub fn to_spec(&self) -> PollSpec {
        PollSpec {
            sensor: self.sensor.clone(),
            source: self.source.to_spec(),
            period_ms: self.period.map(|p| p.as_millis() as u64),
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
            on_success: self.on_success.to_spec(),
            on_failure: self.on_failure.clone(),
            on_exception: self.on_exception.clone(),
            suppress_duplicates: self.suppress_duplicates,
        }
    }

    /// Rebuilds a poll from its persisted form. Function sources and custom
    /// mappings cannot be restored this way.
    pub fn from_spec(spec: &PollSpec) -> Result<Self> {
        let source = match &spec.source {
            SourceSpec::Http {
                url,
                method,
                headers,
                body,
            } => {
                let mut http = HttpPoll::new(url.clone()).method(method.clone());
                for (k, v) in headers {
                    http = http.header(k.clone(), v.clone());
                }
                if let Some(b) = body {
                    http = http.body(b.clone());
                }
                PollSource::Http(http)
            }
            SourceSpec::Command { command, args } => PollSource::Command(CommandPoll {
                command: command.clone(),
                args: args.clone(),
            }),
            SourceSpec::Function { name } => {
                return Err(EngineError::UnsupportedOperation(format!(
                    "Function poll '{}' must be recreated by its entity",
                    name
                )));
            }
        };
        let on_success = match &spec.on_success {
            MappingSpec::Identity => ValueMapping::Identity,
            MappingSpec::Pointer { pointer } => ValueMapping::Pointer(pointer.clone()),
            MappingSpec::Constant { value } => ValueMapping::Constant(value.clone()),
            MappingSpec::Custom { name } => {
                return Err(EngineError::UnsupportedOperation(format!(
                    "Custom mapping '{}' must be recreated by its entity",
                    name
                )));
            }
        };
        Ok(Self {
            sensor: spec.sensor.clone(),
            source,
            period: spec.period_ms.map(Duration::from_millis),
            timeout: spec.timeout_ms.map(Duration::from_millis),
            on_success,
            on_failure: spec.on_failure.clone(),
            on_exception: spec.on_exception.clone(),
            suppress_duplicates: spec.suppress_duplicates,
        })
    }
}

// --- persisted forms ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SourceSpec {
    Function {
        name: String,
    },
    Http {
        url: String,
        method: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MappingSpec {
    Identity,
    Pointer { pointer: String },
    Constant { value: Value },
    Custom { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSpec {
    pub sensor: String,
    pub source: SourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub on_success: MappingSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exception: Option<Value>,
    #[serde(default)]
    pub suppress_duplicates: bool,
}

/// Persisted feed configuration (the payload of a feed memento).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSpec {
    pub unique_tag: String,
    pub entity_id: String,
    pub period_ms: u64,
    pub polls: Vec<PollSpec>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub activated: bool,
}

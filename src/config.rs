use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as AnyhowContext;
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::Result;

/// 管理平面配置
///
/// 所有字段都有默认值，YAML 文件里只需要写需要覆盖的部分。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the in-memory submission queue.
    pub worker_queue_capacity: usize,

    /// Timeout applied to tasks that don't declare one, e.g. `"5m"`.
    pub default_task_timeout: Option<String>,

    pub persistence: PersistenceConfig,

    pub feeds: FeedConfig,

    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub dir: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    pub default_period_ms: u64,
    /// Number of finished poll tasks kept per feed for the audit trail.
    pub poll_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_queue_capacity: 1024,
            default_task_timeout: None,
            persistence: PersistenceConfig::default(),
            feeds: FeedConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: None,
            redis_url: None,
            redis_prefix: "helmsman".to_string(),
            period_ms: 1000,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_period_ms: 500,
            poll_history: 10,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(content).context("Failed to parse engine config")?;
        // fail early on malformed durations rather than at first task
        config.default_timeout()?;
        Ok(config)
    }

    pub fn default_timeout(&self) -> Result<Option<Duration>> {
        self.default_task_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
    }

    pub fn persistence_period(&self) -> Duration {
        Duration::from_millis(self.persistence.period_ms)
    }

    pub fn default_poll_period(&self) -> Duration {
        Duration::from_millis(self.feeds.default_period_ms)
    }
}

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context as AnyhowContext;
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::persistence::memento::BrooklynObjectType;
use crate::persistence::transformer::{CompoundTransformer, CompoundTransformerBuilder, RuleSpec};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFile {
    #[serde(default)]
    deletions: BTreeMap<BrooklynObjectType, Vec<String>>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    #[serde(default)]
    types: Vec<BrooklynObjectType>,
    #[serde(flatten)]
    rule: RuleSpec,
}

/// 从 YAML 读取迁移规则
///
/// ```yaml
/// deletions:
///   entity: [e1, e2]
/// rules:
///   - op: rename-type
///     from: old.Type
///     to: new.Type
///   - op: delete-element
///     name: legacyConfig
///     types: [entity]
/// ```
pub struct CompoundTransformerLoader;

impl CompoundTransformerLoader {
    pub fn from_yaml(content: &str) -> Result<CompoundTransformerBuilder> {
        let file: RulesFile = serde_yaml::from_str(content)
            .map_err(|e| EngineError::IllegalArgument(format!("Invalid transform rules: {}", e)))?;
        let mut builder = CompoundTransformer::builder();
        for (kind, ids) in file.deletions {
            builder = builder.delete(kind, ids);
        }
        for entry in file.rules {
            builder = builder.rule_for(&entry.types, entry.rule);
        }
        Ok(builder)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<CompoundTransformer> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read transform rules from {}", path.display()))?;
        Self::from_yaml(&content)?.build()
    }
}

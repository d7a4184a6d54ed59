use std::fs;
use std::path::Path;

use anyhow::Context as AnyhowContext;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::workflow::WorkflowDefinition;
use crate::workflow::registry::StepRegistry;

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    name: String,
    #[serde(default)]
    input: Map<String, Value>,
    steps: Vec<Value>,
    #[serde(default)]
    output: Option<Value>,
}

/// A workflow file: the definition plus default inputs.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub definition: WorkflowDefinition,
    pub input: Map<String, Value>,
}

pub fn parse_workflow_yaml(registry: &StepRegistry, content: &str) -> Result<LoadedWorkflow> {
    let file: WorkflowFile = serde_yaml::from_str(content)
        .map_err(|e| EngineError::IllegalArgument(format!("Invalid workflow YAML: {}", e)))?;
    let mut definition = WorkflowDefinition::parse(registry, file.name, &file.steps)?;
    definition.output = file.output;
    Ok(LoadedWorkflow {
        definition,
        input: file.input,
    })
}

pub fn load_workflow_from_yaml(
    registry: &StepRegistry,
    file_path: impl AsRef<Path>,
) -> Result<LoadedWorkflow> {
    let file_path = file_path.as_ref();
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path.display()))?;
    parse_workflow_yaml(registry, &yaml_content)
}

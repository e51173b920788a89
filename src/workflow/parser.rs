//! Workflow File Parsing
//!
//! Loads workflow definitions from YAML or JSON files and saves them back.
//! Step output references (`${steps.<id>}`) are folded into each step's
//! explicit `depends_on` list so that the declared dependency graph is
//! complete once the definition is loaded.

use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{EngineError, Result};

use super::model::WorkflowDefinition;
use super::validator::validate_structure;

/// Loads a workflow definition from a file.
///
/// The format is chosen by extension: `.json` is parsed as JSON, anything
/// else as YAML. The structure is validated; handler resolvability is
/// checked later, at submission.
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let mut workflow: WorkflowDefinition = if is_json {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };

    if workflow.id.trim().is_empty() {
        workflow.id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
    }

    finish_loading(workflow)
}

/// Parses a workflow definition from YAML text.
pub fn parse_workflow(content: &str) -> Result<WorkflowDefinition> {
    let workflow: WorkflowDefinition = serde_yaml::from_str(content)?;
    finish_loading(workflow)
}

fn finish_loading(mut workflow: WorkflowDefinition) -> Result<WorkflowDefinition> {
    if workflow.name.trim().is_empty() {
        workflow.name = workflow.id.clone();
    }

    populate_dependencies(&mut workflow);

    let errors = validate_structure(&workflow);
    if !errors.is_empty() {
        return Err(EngineError::Validation(errors));
    }

    info!(
        "Parsed workflow '{}' v{}: {} steps, {} handler types",
        workflow.id,
        workflow.version,
        workflow.steps.len(),
        workflow.handler_types().len()
    );
    Ok(workflow)
}

/// Adds every `${steps.<id>}` reference to the step's `depends_on` list.
pub fn populate_dependencies(workflow: &mut WorkflowDefinition) {
    for (index, step) in workflow.steps.iter_mut().enumerate() {
        let referenced = step.referenced_steps();
        for id in referenced {
            if !step.depends_on.contains(&id) {
                debug!("Step '{}' consumes output of '{}'", step.key(index), id);
                step.depends_on.push(id);
            }
        }
    }
}

/// Saves a workflow definition to a YAML file.
pub fn save_workflow(workflow: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<()> {
    let yaml_content = serde_yaml::to_string(workflow)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Workflow saved to: {}", path.as_ref().display());
    Ok(())
}

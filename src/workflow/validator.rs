//! Workflow Validation
//!
//! Submission-time validation of workflow definitions:
//! - Structural checks (non-empty, ids, inputs, retry policy, resources)
//! - Dependency integrity (references must name an *earlier* step, which
//!   also rules out cycles)
//! - Handler resolvability against the registry
//!
//! Every problem is collected so the submitter sees the full list at once.

use std::collections::HashMap;

use log::{debug, info};

use crate::error::{EngineError, Result, ValidationError};
use crate::handlers::HandlerRegistry;

use super::model::{StepSpec, WorkflowDefinition};

/// Validates a single step's fields.
fn validate_step(step: &StepSpec, key: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.handler.trim().is_empty() {
        errors.push(ValidationError::EmptyHandlerType {
            step: key.to_string(),
        });
    }

    if !step.inputs.is_object() && !step.inputs.is_null() {
        errors.push(ValidationError::InvalidInputs {
            step: key.to_string(),
        });
    }

    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            errors.push(ValidationError::InvalidRetryPolicy {
                step: key.to_string(),
            });
        }
    }

    for resource in &step.resources {
        if resource.name.trim().is_empty() {
            errors.push(ValidationError::InvalidResource {
                step: key.to_string(),
                resource: resource.name.clone(),
                reason: "empty name".to_string(),
            });
        } else if !resource.exclusive && resource.amount == 0 {
            errors.push(ValidationError::InvalidResource {
                step: key.to_string(),
                resource: resource.name.clone(),
                reason: "amount must be positive".to_string(),
            });
        }
    }

    errors
}

/// Structural validation that does not need a handler registry.
pub fn validate_structure(workflow: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if workflow.id.trim().is_empty() {
        errors.push(ValidationError::EmptyWorkflowId);
    }

    if workflow.steps.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
        return errors;
    }

    // Map of step id -> declared position
    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (index, step) in workflow.steps.iter().enumerate() {
        if let Some(id) = step.id.as_deref() {
            if id.is_empty() {
                continue;
            }
            if positions.insert(id, index).is_some() {
                errors.push(ValidationError::DuplicateStepId(id.to_string()));
            }
        }
    }

    for (index, step) in workflow.steps.iter().enumerate() {
        let key = step.key(index);
        errors.extend(validate_step(step, &key));

        for dependency in step.dependencies() {
            match positions.get(dependency.as_str()) {
                None => errors.push(ValidationError::InvalidReference {
                    step: key.clone(),
                    reference: dependency,
                }),
                Some(&position) if position >= index => {
                    errors.push(ValidationError::ForwardReference {
                        step: key.clone(),
                        reference: dependency,
                    })
                }
                Some(_) => {}
            }
        }

        if step.dependencies().is_empty() {
            debug!("Step '{}' has no dependencies", key);
        }
    }

    errors
}

/// Validates a workflow for submission.
///
/// Performs the following checks:
/// 1. Workflow has an id and at least one step
/// 2. No duplicate step ids
/// 3. All steps have valid fields
/// 4. All dependencies point to earlier steps
/// 5. Every handler type resolves in the registry
pub fn validate_workflow(workflow: &WorkflowDefinition, registry: &HandlerRegistry) -> Result<()> {
    info!(
        "Validating workflow '{}' with {} steps",
        workflow.id,
        workflow.steps.len()
    );

    let mut errors = validate_structure(workflow);

    for (index, step) in workflow.steps.iter().enumerate() {
        if step.handler.trim().is_empty() {
            continue;
        }
        if !registry.contains(&step.handler) {
            errors.push(ValidationError::UnknownHandler {
                step: step.key(index),
                handler: step.handler.clone(),
            });
        }
    }

    if !errors.is_empty() {
        return Err(EngineError::Validation(errors));
    }

    debug!(
        "Workflow '{}' validated: handlers {:?}",
        workflow.id,
        workflow.handler_types()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{registry_with, RecordingHandler};
    use crate::workflow::model::{ResourceRequirement, RetryPolicy};
    use serde_json::json;

    fn registry() -> HandlerRegistry {
        registry_with(&[("echo", RecordingHandler::new())])
    }

    #[test]
    fn test_valid_workflow() {
        let workflow = WorkflowDefinition::new("wf")
            .with_step(StepSpec::new("echo").with_id("a"))
            .with_step(StepSpec::new("echo").depends_on("a"));

        assert!(validate_workflow(&workflow, &registry()).is_ok());
    }

    #[test]
    fn test_empty_workflow() {
        let workflow = WorkflowDefinition::new("wf");
        let errors = validate_structure(&workflow);
        assert_eq!(errors, vec![ValidationError::EmptyWorkflow]);
    }

    #[test]
    fn test_unknown_handler_rejected() {
        let workflow = WorkflowDefinition::new("wf")
            .with_step(StepSpec::new("echo"))
            .with_step(StepSpec::new("browser").with_id("scrape"));

        match validate_workflow(&workflow, &registry()) {
            Err(EngineError::Validation(errors)) => {
                assert_eq!(
                    errors,
                    vec![ValidationError::UnknownHandler {
                        step: "scrape".to_string(),
                        handler: "browser".to_string(),
                    }]
                );
            }
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_step_ids() {
        let workflow = WorkflowDefinition::new("wf")
            .with_step(StepSpec::new("echo").with_id("a"))
            .with_step(StepSpec::new("echo").with_id("a"));

        let errors = validate_structure(&workflow);
        assert!(errors.contains(&ValidationError::DuplicateStepId("a".to_string())));
    }

    #[test]
    fn test_unknown_and_forward_references() {
        let workflow = WorkflowDefinition::new("wf")
            .with_step(StepSpec::new("echo").with_id("a").depends_on("b"))
            .with_step(StepSpec::new("echo").with_id("b"))
            .with_step(StepSpec::new("echo").with_input("x", json!("${steps.missing}")));

        let errors = validate_structure(&workflow);
        assert!(errors.contains(&ValidationError::ForwardReference {
            step: "a".to_string(),
            reference: "b".to_string(),
        }));
        assert!(errors.contains(&ValidationError::InvalidReference {
            step: "#2".to_string(),
            reference: "missing".to_string(),
        }));
    }

    #[test]
    fn test_self_reference_is_forward() {
        let workflow =
            WorkflowDefinition::new("wf").with_step(StepSpec::new("echo").with_id("a").depends_on("a"));
        let errors = validate_structure(&workflow);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_invalid_step_fields() {
        let workflow = WorkflowDefinition::new("wf").with_step(
            StepSpec::new("")
                .with_inputs(json!([1, 2]))
                .with_retry(RetryPolicy::attempts(0))
                .with_resource(ResourceRequirement::counted("cpu", 0))
                .with_resource(ResourceRequirement::counted(" ", 1)),
        );

        let errors = validate_structure(&workflow);
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_empty_workflow_id() {
        let workflow = WorkflowDefinition::new(" ").with_step(StepSpec::new("echo"));
        let errors = validate_structure(&workflow);
        assert_eq!(errors, vec![ValidationError::EmptyWorkflowId]);
    }
}

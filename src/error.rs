//! Error Types
//!
//! Two layers of failure are modelled here:
//!
//! - [`EngineError`]: errors returned by public operations (submission,
//!   registration, configuration, status queries).
//! - [`StepError`]: failure detail recorded on a [`StepResult`](crate::workflow::StepResult).
//!   Step failures are data, not raised errors; retry decisions are made
//!   from [`StepErrorKind::is_retryable`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::execution::ExecutionStatus;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// A single problem found while validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyWorkflowId,
    EmptyHandlerType { step: String },
    DuplicateStepId(String),
    UnknownHandler { step: String, handler: String },
    InvalidReference { step: String, reference: String },
    ForwardReference { step: String, reference: String },
    InvalidResource { step: String, resource: String, reason: String },
    InvalidRetryPolicy { step: String },
    InvalidInputs { step: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::EmptyWorkflowId => write!(f, "Workflow has an empty id"),
            Self::EmptyHandlerType { step } => {
                write!(f, "Step '{}' has no handler type specified", step)
            }
            Self::DuplicateStepId(id) => write!(f, "Duplicate step ID: '{}'", id),
            Self::UnknownHandler { step, handler } => write!(
                f,
                "Step '{}' uses handler '{}' which is not registered",
                step, handler
            ),
            Self::InvalidReference { step, reference } => {
                write!(f, "Step '{}' references unknown step '{}'", step, reference)
            }
            Self::ForwardReference { step, reference } => write!(
                f,
                "Step '{}' depends on '{}' which is declared after it",
                step, reference
            ),
            Self::InvalidResource {
                step,
                resource,
                reason,
            } => write!(
                f,
                "Step '{}': resource '{}' is invalid ({})",
                step, resource, reason
            ),
            Self::InvalidRetryPolicy { step } => {
                write!(f, "Step '{}': retry policy needs at least one attempt", step)
            }
            Self::InvalidInputs { step } => {
                write!(f, "Step '{}': inputs must be a key/value map", step)
            }
        }
    }
}

fn join_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid workflow: {}", join_validation(.0))]
    Validation(Vec<ValidationError>),

    #[error("Capacity exceeded: {what} is full (capacity {capacity})")]
    CapacityExceeded { what: String, capacity: usize },

    #[error("No handler registered for type '{0}'")]
    HandlerNotFound(String),

    #[error("Resource '{resource}' unavailable after waiting {waited_ms} ms")]
    ResourceUnavailable { resource: String, waited_ms: u64 },

    #[error("Handler '{handler}' failed: {message}")]
    HandlerExecution { handler: String, message: String },

    #[error("Handler type '{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("Handler type '{0}' is still referenced by in-flight executions")]
    HandlerInUse(String),

    #[error("Cannot build adapter for '{handler}': {reason}")]
    AdapterMismatch { handler: String, reason: String },

    #[error("Execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Step {step_index} already recorded for execution '{execution_id}'")]
    DuplicateStepResult {
        execution_id: String,
        step_index: usize,
    },

    #[error("Execution '{0}' has already finished")]
    ExecutionFinished(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Returns true when the caller may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::ResourceUnavailable { .. }
        )
    }
}

/// Category of a recorded step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    HandlerNotFound,
    ResourceUnavailable,
    HandlerExecution,
    HandlerTimeout,
    PredictedFailure,
    WorkflowTimeout,
}

impl StepErrorKind {
    /// Retryable failures are re-attempted according to the step's retry policy.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ResourceUnavailable | Self::HandlerExecution | Self::HandlerTimeout
        )
    }
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HandlerNotFound => "handler_not_found",
            Self::ResourceUnavailable => "resource_unavailable",
            Self::HandlerExecution => "handler_execution",
            Self::HandlerTimeout => "handler_timeout",
            Self::PredictedFailure => "predicted_failure",
            Self::WorkflowTimeout => "workflow_timeout",
        };
        f.write_str(name)
    }
}

/// Failure detail attached to a step result or to a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl From<&EngineError> for StepError {
    fn from(err: &EngineError) -> Self {
        let kind = match err {
            EngineError::HandlerNotFound(_) => StepErrorKind::HandlerNotFound,
            EngineError::ResourceUnavailable { .. } => StepErrorKind::ResourceUnavailable,
            _ => StepErrorKind::HandlerExecution,
        };
        StepError::new(kind, err.to_string())
    }
}

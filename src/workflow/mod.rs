//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! validating and planning workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowDefinition, StepSpec)
//! - [`parser`]: YAML/JSON loading and saving
//! - [`validator`]: Submission-time validation rules
//! - [`optimizer`]: Pure execution planning (grouping, reordering, batching)
//! - [`execution`]: Execution records and their status state machine

pub mod execution;
pub mod model;
pub mod optimizer;
pub mod parser;
pub mod validator;

pub use execution::{ExecutionStatus, StepResult, WorkflowExecution};
pub use model::{
    step_reference, ExecutionOptions, Priority, ResourceRequirement, RetryPolicy, StepSpec,
    StrategyKind, WorkflowDefinition,
};
pub use optimizer::{optimize, DependencyGraph, Dispatch, ExecutionGroup, ExecutionPlan, OptimizerOptions};
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use validator::validate_workflow;

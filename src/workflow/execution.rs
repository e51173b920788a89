//! Execution Records
//!
//! [`WorkflowExecution`] is one run of a workflow definition. Its status
//! follows a monotonic state machine:
//!
//! ```text
//! queued ──▶ running ──▶ completed | failed | cancelled
//!    │          │
//!    │          └──▶ cancelling ──▶ cancelled | failed
//!    └──▶ cancelled
//! ```
//!
//! Terminal states are final. [`StepResult`]s are appended in dispatch
//! order and never modified afterwards.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result, StepError};

use super::model::{Priority, StrategyKind, WorkflowDefinition};

/// Lifecycle status of a workflow execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true for states no transition may leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Running, Cancelled)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Cancelling => "cancelling",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Outcome of one dispatched step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Index of the step in the declared workflow
    pub step_index: usize,
    pub step_key: String,
    pub handler: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub duration_ms: u64,
    pub cache_hit: bool,
    /// Number of attempts made (0 when the step was never dispatched)
    pub attempts: u32,
    /// Whether the step ran as part of a batched dispatch
    #[serde(default)]
    pub batched: bool,
    /// Whether the step was flagged as likely to fail
    #[serde(default)]
    pub flagged: bool,
    pub started_at: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(
        step_index: usize,
        step_key: impl Into<String>,
        handler: impl Into<String>,
        output: Value,
    ) -> Self {
        Self {
            step_index,
            step_key: step_key.into(),
            handler: handler.into(),
            success: true,
            output: Some(output),
            error: None,
            duration_ms: 0,
            cache_hit: false,
            attempts: 1,
            batched: false,
            flagged: false,
            started_at: Utc::now(),
        }
    }

    pub fn failed(
        step_index: usize,
        step_key: impl Into<String>,
        handler: impl Into<String>,
        error: StepError,
    ) -> Self {
        Self {
            step_index,
            step_key: step_key.into(),
            handler: handler.into(),
            success: false,
            output: None,
            error: Some(error),
            duration_ms: 0,
            cache_hit: false,
            attempts: 1,
            batched: false,
            flagged: false,
            started_at: Utc::now(),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }
}

/// A run of a workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub status: ExecutionStatus,
    pub strategy: StrategyKind,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_duration_ms: Option<u64>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub step_results: Vec<StepResult>,
    /// Outputs of successful steps keyed by step key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// First critical failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl WorkflowExecution {
    /// Creates a queued execution for a definition.
    pub fn new(
        execution_id: impl Into<String>,
        definition: &WorkflowDefinition,
        strategy: StrategyKind,
        priority: Priority,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            workflow_version: definition.version.clone(),
            owner: None,
            status: ExecutionStatus::Queued,
            strategy,
            priority,
            estimated_duration_ms: None,
            actual_duration_ms: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            step_results: Vec::new(),
            output: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Moves the execution to `next`, stamping start/finish times.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            if let Some(started) = self.started_at {
                let elapsed = (now - started).num_milliseconds().max(0);
                self.actual_duration_ms = Some(elapsed as u64);
            }
        }
        self.status = next;
        Ok(())
    }

    /// Appends a step result; a step index may only be recorded once.
    pub fn record_step(&mut self, result: StepResult) -> Result<()> {
        if self.status.is_terminal() {
            return Err(EngineError::ExecutionFinished(self.execution_id.clone()));
        }
        if self
            .step_results
            .iter()
            .any(|r| r.step_index == result.step_index)
        {
            return Err(EngineError::DuplicateStepResult {
                execution_id: self.execution_id.clone(),
                step_index: result.step_index,
            });
        }

        if result.success {
            if let Some(output) = &result.output {
                let map = self
                    .output
                    .get_or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(map) = map {
                    map.insert(result.step_key.clone(), output.clone());
                }
            }
        }
        self.step_results.push(result);
        Ok(())
    }

    /// Output of a previously recorded successful step.
    pub fn step_output(&self, step_key: &str) -> Option<&Value> {
        self.step_results
            .iter()
            .find(|r| r.step_key == step_key && r.success)
            .and_then(|r| r.output.as_ref())
    }

    /// Number of recorded step failures, critical or not.
    pub fn failed_steps(&self) -> usize {
        self.step_results.iter().filter(|r| !r.success).count()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepErrorKind;
    use crate::workflow::StepSpec;
    use serde_json::json;

    fn execution() -> WorkflowExecution {
        let definition = WorkflowDefinition::new("wf").with_step(StepSpec::new("echo"));
        WorkflowExecution::new("exec-1", &definition, StrategyKind::Basic, Priority::Normal)
    }

    #[test]
    fn test_new_execution_is_queued() {
        let exec = execution();
        assert_eq!(exec.status, ExecutionStatus::Queued);
        assert!(exec.step_results.is_empty());
        assert!(exec.started_at.is_none());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut exec = execution();
        exec.transition(ExecutionStatus::Running).unwrap();
        assert!(exec.started_at.is_some());
        exec.transition(ExecutionStatus::Completed).unwrap();
        assert!(exec.finished_at.is_some());
        assert!(exec.actual_duration_ms.is_some());
        assert!(exec.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut exec = execution();
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.transition(ExecutionStatus::Failed).unwrap();

        for next in [
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Queued,
        ] {
            assert!(exec.transition(next).is_err());
        }
        assert_eq!(exec.status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_cancelling_path() {
        let mut exec = execution();
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.transition(ExecutionStatus::Cancelling).unwrap();
        assert!(exec.transition(ExecutionStatus::Running).is_err());
        assert!(exec.transition(ExecutionStatus::Completed).is_err());
        exec.transition(ExecutionStatus::Cancelled).unwrap();
    }

    #[test]
    fn test_queued_cannot_complete_directly() {
        let mut exec = execution();
        assert!(exec.transition(ExecutionStatus::Completed).is_err());
        assert!(exec.transition(ExecutionStatus::Cancelled).is_ok());
    }

    #[test]
    fn test_record_step_rejects_duplicate_index() {
        let mut exec = execution();
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.record_step(StepResult::succeeded(0, "a", "echo", json!(1)))
            .unwrap();
        assert!(exec
            .record_step(StepResult::succeeded(0, "a", "echo", json!(2)))
            .is_err());
        assert_eq!(exec.step_results.len(), 1);
    }

    #[test]
    fn test_record_step_collects_outputs() {
        let mut exec = execution();
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.record_step(StepResult::succeeded(0, "a", "echo", json!({"v": 1})))
            .unwrap();
        exec.record_step(StepResult::failed(
            1,
            "b",
            "fail",
            StepError::new(StepErrorKind::HandlerExecution, "boom"),
        ))
        .unwrap();

        assert_eq!(exec.step_output("a"), Some(&json!({"v": 1})));
        assert!(exec.step_output("b").is_none());
        assert_eq!(exec.failed_steps(), 1);
        assert_eq!(exec.output, Some(json!({"a": {"v": 1}})));
    }

    #[test]
    fn test_execution_serialization() {
        let exec = execution();
        let json = serde_json::to_string(&exec).unwrap();
        assert!(json.contains("\"status\":\"queued\""));
        let back: WorkflowExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(back.execution_id, "exec-1");
    }
}

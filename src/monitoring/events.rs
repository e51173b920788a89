//! Execution lifecycle events
//!
//! The engine and scheduler publish [`ExecutionEvent`]s to every
//! registered [`EventSink`]. Sinks are called inline and must not block.

use std::sync::Mutex;

use log::{debug, info, warn};
use serde::Serialize;

use crate::util::lock;
use crate::workflow::StrategyKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started {
        execution_id: String,
        workflow_id: String,
        strategy: StrategyKind,
        step_count: usize,
    },
    StepStarted {
        execution_id: String,
        step_index: usize,
        step_key: String,
        handler: String,
    },
    StepCompleted {
        execution_id: String,
        step_index: usize,
        step_key: String,
        handler: String,
        success: bool,
        cache_hit: bool,
        duration_ms: u64,
    },
    /// Step predicted to fail from its handler's history
    StepFlagged {
        execution_id: String,
        step_index: usize,
        step_key: String,
        failure_rate: f64,
    },
    Completed {
        execution_id: String,
        duration_ms: u64,
    },
    Failed {
        execution_id: String,
        step_key: Option<String>,
        error: String,
    },
    Cancelled {
        execution_id: String,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::Started { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepCompleted { execution_id, .. }
            | ExecutionEvent::StepFlagged { execution_id, .. }
            | ExecutionEvent::Completed { execution_id, .. }
            | ExecutionEvent::Failed { execution_id, .. }
            | ExecutionEvent::Cancelled { execution_id } => execution_id,
        }
    }

    /// Whether this is the last event of an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Completed { .. }
                | ExecutionEvent::Failed { .. }
                | ExecutionEvent::Cancelled { .. }
        )
    }
}

/// Consumer of execution events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ExecutionEvent);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::Started {
                execution_id,
                workflow_id,
                strategy,
                step_count,
            } => info!(
                "[{}] Started workflow '{}' ({} steps, {} strategy)",
                execution_id, workflow_id, step_count, strategy
            ),
            ExecutionEvent::StepStarted {
                execution_id,
                step_key,
                handler,
                ..
            } => debug!("[{}] Step '{}' -> {}", execution_id, step_key, handler),
            ExecutionEvent::StepCompleted {
                execution_id,
                step_key,
                success,
                cache_hit,
                duration_ms,
                ..
            } => {
                let state = match (success, cache_hit) {
                    (true, true) => "cached",
                    (true, false) => "ok",
                    (false, _) => "failed",
                };
                info!("[{}] Step '{}' {} ({} ms)", execution_id, step_key, state, duration_ms);
            }
            ExecutionEvent::StepFlagged {
                execution_id,
                step_key,
                failure_rate,
                ..
            } => warn!(
                "[{}] Step '{}' is likely to fail ({:.0}% recent failures)",
                execution_id,
                step_key,
                failure_rate * 100.0
            ),
            ExecutionEvent::Completed {
                execution_id,
                duration_ms,
            } => info!("[{}] Completed in {} ms", execution_id, duration_ms),
            ExecutionEvent::Failed {
                execution_id,
                step_key,
                error,
            } => warn!(
                "[{}] Failed at step '{}': {}",
                execution_id,
                step_key.as_deref().unwrap_or("-"),
                error
            ),
            ExecutionEvent::Cancelled { execution_id } => info!("[{}] Cancelled", execution_id),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        lock(&self.events).clone()
    }

    pub fn for_execution(&self, execution_id: &str) -> Vec<ExecutionEvent> {
        lock(&self.events)
            .iter()
            .filter(|event| event.execution_id() == execution_id)
            .cloned()
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &ExecutionEvent) {
        lock(&self.events).push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_filters_by_execution() {
        let sink = MemorySink::new();
        sink.emit(&ExecutionEvent::Cancelled {
            execution_id: "a".to_string(),
        });
        sink.emit(&ExecutionEvent::Completed {
            execution_id: "b".to_string(),
            duration_ms: 3,
        });

        assert_eq!(sink.events().len(), 2);
        let b = sink.for_execution("b");
        assert_eq!(b.len(), 1);
        assert!(b[0].is_terminal());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ExecutionEvent::StepFlagged {
            execution_id: "a".to_string(),
            step_index: 1,
            step_key: "deploy".to_string(),
            failure_rate: 0.5,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "step_flagged");
        assert_eq!(value["step_key"], "deploy");
        assert!(!event.is_terminal());
    }
}

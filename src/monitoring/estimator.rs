//! Execution Monitor
//!
//! Rolling per-handler estimates built from observed step results:
//! an exponentially weighted moving average of duration, and the failure
//! rate over recent dispatches. The Smart strategy reads these to time
//! resource acquisition and to flag steps likely to fail; the scheduler
//! uses them to fill in estimated execution durations.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::util::lock;
use crate::workflow::{StepResult, WorkflowDefinition};

/// Default weight of the newest observation.
pub const DEFAULT_SMOOTHING: f64 = 0.3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HandlerEstimate {
    /// Dispatches observed (cache hits excluded)
    pub samples: u64,
    /// Smoothed duration of successful and failed dispatches
    pub expected_ms: f64,
    /// Smoothed failure indicator (0.0 = never fails, 1.0 = always fails)
    pub failure_rate: f64,
}

#[derive(Debug)]
pub struct ExecutionMonitor {
    smoothing: f64,
    estimates: Mutex<HashMap<String, HandlerEstimate>>,
}

impl ExecutionMonitor {
    pub fn new() -> Self {
        Self::with_smoothing(DEFAULT_SMOOTHING)
    }

    /// `smoothing` is clamped to `(0, 1]`.
    pub fn with_smoothing(smoothing: f64) -> Self {
        Self {
            smoothing: if smoothing > 0.0 { smoothing.min(1.0) } else { DEFAULT_SMOOTHING },
            estimates: Mutex::new(HashMap::new()),
        }
    }

    /// Folds one step result into its handler's estimate.
    ///
    /// Cache hits and steps that never reached the handler are ignored.
    pub fn observe(&self, result: &StepResult) {
        if result.cache_hit || result.attempts == 0 {
            return;
        }
        let failed = if result.success { 0.0 } else { 1.0 };
        let duration = result.duration_ms as f64 / f64::from(result.attempts.max(1));

        let mut estimates = lock(&self.estimates);
        let estimate = estimates.entry(result.handler.clone()).or_default();
        if estimate.samples == 0 {
            estimate.expected_ms = duration;
            estimate.failure_rate = failed;
        } else {
            let a = self.smoothing;
            estimate.expected_ms = a * duration + (1.0 - a) * estimate.expected_ms;
            estimate.failure_rate = a * failed + (1.0 - a) * estimate.failure_rate;
        }
        estimate.samples += 1;
    }

    pub fn estimate(&self, handler: &str) -> Option<HandlerEstimate> {
        lock(&self.estimates).get(handler).copied()
    }

    pub fn expected_duration(&self, handler: &str) -> Option<Duration> {
        self.estimate(handler)
            .map(|estimate| Duration::from_millis(estimate.expected_ms.round() as u64))
    }

    /// Failure rate and sample count, once the handler has been observed.
    pub fn failure_rate(&self, handler: &str) -> Option<(f64, u64)> {
        self.estimate(handler)
            .map(|estimate| (estimate.failure_rate, estimate.samples))
    }

    /// Expected duration of a whole workflow, from the handlers seen so far.
    ///
    /// `None` when no step's handler has been observed yet.
    pub fn estimate_workflow(&self, workflow: &WorkflowDefinition) -> Option<u64> {
        let estimates = lock(&self.estimates);
        let known: Vec<f64> = workflow
            .steps
            .iter()
            .filter_map(|step| estimates.get(&step.handler))
            .map(|estimate| estimate.expected_ms)
            .collect();

        if known.is_empty() {
            None
        } else {
            Some(known.iter().sum::<f64>().round() as u64)
        }
    }
}

impl Default for ExecutionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StepError, StepErrorKind};
    use crate::workflow::StepSpec;
    use serde_json::json;

    fn ok(handler: &str, ms: u64) -> StepResult {
        StepResult::succeeded(0, "#0", handler, json!(null)).with_duration_ms(ms)
    }

    fn failed(handler: &str, ms: u64) -> StepResult {
        StepResult::failed(
            0,
            "#0",
            handler,
            StepError::new(StepErrorKind::HandlerExecution, "boom"),
        )
        .with_duration_ms(ms)
        .with_attempts(1)
    }

    #[test]
    fn test_ewma_duration() {
        let monitor = ExecutionMonitor::with_smoothing(0.5);
        monitor.observe(&ok("echo", 100));
        monitor.observe(&ok("echo", 200));

        assert_eq!(monitor.expected_duration("echo"), Some(Duration::from_millis(150)));
        assert_eq!(monitor.failure_rate("echo"), Some((0.0, 2)));
        assert!(monitor.expected_duration("shell").is_none());
    }

    #[test]
    fn test_failure_rate_tracks_recent_outcomes() {
        let monitor = ExecutionMonitor::with_smoothing(0.5);
        monitor.observe(&failed("flaky", 10));
        monitor.observe(&failed("flaky", 10));
        let (rate, samples) = monitor.failure_rate("flaky").unwrap();
        assert_eq!(samples, 2);
        assert_eq!(rate, 1.0);

        monitor.observe(&ok("flaky", 10));
        assert_eq!(monitor.failure_rate("flaky").unwrap().0, 0.5);
    }

    #[test]
    fn test_cache_hits_ignored() {
        let monitor = ExecutionMonitor::new();
        let mut hit = ok("echo", 1);
        hit.cache_hit = true;
        monitor.observe(&hit);
        assert!(monitor.estimate("echo").is_none());
    }

    #[test]
    fn test_estimate_workflow() {
        let monitor = ExecutionMonitor::new();
        let workflow = WorkflowDefinition::new("wf")
            .with_step(StepSpec::new("echo"))
            .with_step(StepSpec::new("echo"))
            .with_step(StepSpec::new("shell"));
        assert_eq!(monitor.estimate_workflow(&workflow), None);

        monitor.observe(&ok("echo", 40));
        assert_eq!(monitor.estimate_workflow(&workflow), Some(80));
    }
}

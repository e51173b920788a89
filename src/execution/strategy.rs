//! Execution Strategies
//!
//! A strategy decides *how* an execution is scheduled, never *what* it
//! produces:
//!
//! | Strategy    | Plan                      | Cache | Extras                          |
//! |-------------|---------------------------|-------|---------------------------------|
//! | `basic`     | declared order            | no    |                                 |
//! | `optimized` | optimizer (group + batch) | yes   |                                 |
//! | `smart`     | optimizer (group + batch) | yes   | failure flags, group pre-leases |

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::SmartConfig;
use crate::monitoring::ExecutionMonitor;
use crate::workflow::{
    optimize, ExecutionGroup, ExecutionPlan, OptimizerOptions, ResourceRequirement, StepSpec,
    StrategyKind,
};

/// Inputs the planner needs besides the steps themselves.
#[derive(Debug, Clone, Default)]
pub struct PlanningContext {
    /// Handler types that implement batched dispatch
    pub batchable: BTreeSet<String>,
    pub max_batch_size: usize,
}

pub trait ExecutionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn plan(&self, steps: &[StepSpec], context: &PlanningContext) -> ExecutionPlan;

    /// Whether cacheable steps consult the execution cache.
    fn uses_cache(&self) -> bool;

    /// Failure rate that makes this step worth flagging, if any.
    fn flag(&self, _step: &StepSpec, _monitor: &ExecutionMonitor) -> Option<f64> {
        None
    }

    /// Whether flagged steps are recorded as failed instead of dispatched.
    fn skip_flagged(&self) -> bool {
        false
    }

    /// Resources to acquire once for a whole group, before its first step.
    fn group_lease(
        &self,
        _group: &ExecutionGroup,
        _steps: &[StepSpec],
        _monitor: &ExecutionMonitor,
    ) -> Option<Vec<ResourceRequirement>> {
        None
    }
}

/// Declared order, no cache. The reference for output equivalence.
pub struct BasicStrategy;

impl ExecutionStrategy for BasicStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Basic
    }

    fn plan(&self, steps: &[StepSpec], _context: &PlanningContext) -> ExecutionPlan {
        ExecutionPlan::sequential(steps)
    }

    fn uses_cache(&self) -> bool {
        false
    }
}

/// Optimizer plan plus cache.
pub struct OptimizedStrategy;

impl ExecutionStrategy for OptimizedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Optimized
    }

    fn plan(&self, steps: &[StepSpec], context: &PlanningContext) -> ExecutionPlan {
        optimize(
            steps,
            &OptimizerOptions::new(context.batchable.clone(), context.max_batch_size),
        )
    }

    fn uses_cache(&self) -> bool {
        true
    }
}

/// Optimized, plus history-driven flagging and resource pre-acquisition.
pub struct SmartStrategy {
    config: SmartConfig,
}

impl SmartStrategy {
    pub fn new(config: SmartConfig) -> Self {
        Self { config }
    }
}

impl ExecutionStrategy for SmartStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Smart
    }

    fn plan(&self, steps: &[StepSpec], context: &PlanningContext) -> ExecutionPlan {
        OptimizedStrategy.plan(steps, context)
    }

    fn uses_cache(&self) -> bool {
        true
    }

    fn flag(&self, step: &StepSpec, monitor: &ExecutionMonitor) -> Option<f64> {
        let (rate, samples) = monitor.failure_rate(&step.handler)?;
        (samples >= self.config.min_samples && rate >= self.config.failure_threshold).then_some(rate)
    }

    fn skip_flagged(&self) -> bool {
        self.config.skip_predicted_failures
    }

    /// Pre-leases the union of a group's requirements when every step in
    /// the group has an estimate and the group is expected to be short.
    /// Groups with a single dispatch gain nothing and are left alone.
    fn group_lease(
        &self,
        group: &ExecutionGroup,
        steps: &[StepSpec],
        monitor: &ExecutionMonitor,
    ) -> Option<Vec<ResourceRequirement>> {
        if group.dispatches.len() < 2 {
            return None;
        }

        let mut expected_ms: u64 = 0;
        let mut requirements = Vec::new();
        for index in group.step_indices() {
            let step = steps.get(index)?;
            let expected = monitor.expected_duration(&step.handler)?;
            expected_ms = expected_ms.saturating_add(expected.as_millis() as u64);
            requirements.extend(step.resources.iter().cloned());
        }

        if requirements.is_empty() || expected_ms > self.config.preacquire_max_group_ms {
            return None;
        }
        Some(requirements)
    }
}

/// The strategy implementation for a kind.
pub fn strategy_for(kind: StrategyKind, smart: &SmartConfig) -> Arc<dyn ExecutionStrategy> {
    match kind {
        StrategyKind::Basic => Arc::new(BasicStrategy),
        StrategyKind::Optimized => Arc::new(OptimizedStrategy),
        StrategyKind::Smart => Arc::new(SmartStrategy::new(smart.clone())),
    }
}

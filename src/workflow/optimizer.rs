//! Workflow Optimizer
//!
//! Turns a declared step sequence into an [`ExecutionPlan`]: an ordered list
//! of execution groups, each holding one or more dispatches.
//!
//! Planning is a pure function of the steps and the optimizer options. It
//! performs no I/O, so the same input always yields the same plan.
//!
//! # Rules
//!
//! - Edges of the dependency graph run from an earlier step to a later one
//!   when the later step declares `depends_on`, consumes the earlier step's
//!   output, or shares an exclusive resource with it.
//! - A critical step is a barrier: it follows every earlier step and
//!   precedes every later one. Only runs of non-critical steps between
//!   barriers are free to move, so a critical failure stops the same steps
//!   as in declared order.
//! - Groups are longest-path layers of that graph. A step never lands in a
//!   group before any of its predecessors, so dependent pairs keep their
//!   declared order.
//! - Inside a group steps are clustered by handler type (in order of first
//!   appearance), then by declared position. Clustering exists to put
//!   batchable steps next to each other; counted resource usage plays no
//!   part in the order.
//! - Adjacent steps of a batch-capable handler with identical execution
//!   settings are merged into one batched dispatch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use log::debug;

use super::model::StepSpec;

/// Inputs to the optimizer besides the steps themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizerOptions {
    /// Handler types that accept batched dispatches
    pub batchable: BTreeSet<String>,
    /// Largest number of steps merged into one dispatch (0 or 1 disables merging)
    pub max_batch_size: usize,
}

impl OptimizerOptions {
    pub fn new(batchable: BTreeSet<String>, max_batch_size: usize) -> Self {
        Self {
            batchable,
            max_batch_size,
        }
    }
}

/// One handler invocation covering one or more steps of the same handler type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub handler: String,
    /// Declared step indices, in dispatch order
    pub steps: Vec<usize>,
}

impl Dispatch {
    pub fn single(handler: impl Into<String>, step: usize) -> Self {
        Self {
            handler: handler.into(),
            steps: vec![step],
        }
    }

    pub fn is_batch(&self) -> bool {
        self.steps.len() > 1
    }
}

/// Dispatches whose steps have no ordering constraints between each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionGroup {
    pub dispatches: Vec<Dispatch>,
}

impl ExecutionGroup {
    /// Step indices of this group in dispatch order.
    pub fn step_indices(&self) -> Vec<usize> {
        self.dispatches
            .iter()
            .flat_map(|d| d.steps.iter().copied())
            .collect()
    }
}

/// Ordered execution plan for one workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub groups: Vec<ExecutionGroup>,
}

impl ExecutionPlan {
    /// A plan that runs every step alone, in declared order.
    pub fn sequential(steps: &[StepSpec]) -> Self {
        let groups = steps
            .iter()
            .enumerate()
            .map(|(index, step)| ExecutionGroup {
                dispatches: vec![Dispatch::single(step.handler.clone(), index)],
            })
            .collect();
        Self { groups }
    }

    /// All step indices in the order they will be dispatched.
    pub fn step_order(&self) -> Vec<usize> {
        self.groups.iter().flat_map(|g| g.step_indices()).collect()
    }

    pub fn dispatch_count(&self) -> usize {
        self.groups.iter().map(|g| g.dispatches.len()).sum()
    }

    pub fn step_count(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| g.dispatches.iter())
            .map(|d| d.steps.len())
            .sum()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (number, group) in self.groups.iter().enumerate() {
            writeln!(f, "group {}:", number)?;
            for dispatch in &group.dispatches {
                if dispatch.is_batch() {
                    writeln!(f, "  batch {} {:?}", dispatch.handler, dispatch.steps)?;
                } else {
                    writeln!(f, "  step  {} {:?}", dispatch.handler, dispatch.steps)?;
                }
            }
        }
        Ok(())
    }
}

/// Ordering constraints between declared steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    /// predecessors[j] holds every earlier step j must follow
    predecessors: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Builds the graph from declared and referenced dependencies, shared
    /// exclusive resources and critical barriers. Unknown or forward
    /// references are ignored; the validator rejects them before a workflow
    /// is admitted.
    pub fn build(steps: &[StepSpec]) -> Self {
        let positions: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .filter_map(|(index, step)| step.id.as_deref().map(|id| (id, index)))
            .collect();

        let exclusive: Vec<BTreeSet<&str>> =
            steps.iter().map(StepSpec::exclusive_resources).collect();

        let predecessors = steps
            .iter()
            .enumerate()
            .map(|(later, step)| {
                let mut preds: BTreeSet<usize> = step
                    .dependencies()
                    .iter()
                    .filter_map(|id| positions.get(id.as_str()).copied())
                    .filter(|&earlier| earlier < later)
                    .collect();

                for earlier in 0..later {
                    let barrier = step.critical || steps[earlier].critical;
                    if barrier || !exclusive[later].is_disjoint(&exclusive[earlier]) {
                        preds.insert(earlier);
                    }
                }
                preds
            })
            .collect();

        Self { predecessors }
    }

    /// Direct predecessors of a step.
    pub fn predecessors(&self, step: usize) -> &BTreeSet<usize> {
        &self.predecessors[step]
    }

    /// Whether `later` must run after `earlier` (directly or transitively).
    pub fn must_follow(&self, later: usize, earlier: usize) -> bool {
        let mut stack = vec![later];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            for &pred in &self.predecessors[current] {
                if pred == earlier {
                    return true;
                }
                if seen.insert(pred) {
                    stack.push(pred);
                }
            }
        }
        false
    }

    /// Longest-path layer of every step.
    pub fn levels(&self) -> Vec<usize> {
        let mut levels = vec![0usize; self.predecessors.len()];
        for step in 0..self.predecessors.len() {
            levels[step] = self.predecessors[step]
                .iter()
                .map(|&pred| levels[pred] + 1)
                .max()
                .unwrap_or(0);
        }
        levels
    }

    pub fn len(&self) -> usize {
        self.predecessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predecessors.is_empty()
    }
}

/// Produces an execution plan for the given steps.
pub fn optimize(steps: &[StepSpec], options: &OptimizerOptions) -> ExecutionPlan {
    if steps.is_empty() {
        return ExecutionPlan::default();
    }

    let graph = DependencyGraph::build(steps);
    let levels = graph.levels();

    let mut layers: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, level) in levels.iter().enumerate() {
        layers.entry(*level).or_default().push(index);
    }

    let groups: Vec<ExecutionGroup> = layers
        .into_values()
        .map(|members| ExecutionGroup {
            dispatches: merge_dispatches(steps, &cluster_by_handler(steps, members), options),
        })
        .collect();

    let plan = ExecutionPlan { groups };
    debug!(
        "Optimized {} steps into {} groups / {} dispatches",
        steps.len(),
        plan.groups.len(),
        plan.dispatch_count()
    );
    plan
}

/// Orders a layer by first appearance of each handler type, then position.
fn cluster_by_handler(steps: &[StepSpec], members: Vec<usize>) -> Vec<usize> {
    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    for &index in &members {
        let handler = steps[index].handler.as_str();
        let next_rank = first_seen.len();
        first_seen.entry(handler).or_insert(next_rank);
    }

    let mut ordered = members;
    ordered.sort_by_key(|&index| (first_seen[steps[index].handler.as_str()], index));
    ordered
}

fn merge_dispatches(
    steps: &[StepSpec],
    ordered: &[usize],
    options: &OptimizerOptions,
) -> Vec<Dispatch> {
    let mut dispatches: Vec<Dispatch> = Vec::new();

    for &index in ordered {
        let step = &steps[index];
        if let Some(current) = dispatches.last_mut() {
            let can_merge = options.max_batch_size > 1
                && options.batchable.contains(&step.handler)
                && current.handler == step.handler
                && current.steps.len() < options.max_batch_size
                && compatible(&steps[current.steps[0]], step);
            if can_merge {
                current.steps.push(index);
                continue;
            }
        }
        dispatches.push(Dispatch::single(step.handler.clone(), index));
    }

    dispatches
}

/// Two steps may share a dispatch when they run under identical settings.
fn compatible(a: &StepSpec, b: &StepSpec) -> bool {
    let mut a_resources = a.resources.clone();
    let mut b_resources = b.resources.clone();
    a_resources.sort();
    b_resources.sort();

    a.critical == b.critical
        && a.cacheable == b.cacheable
        && a.timeout_ms == b.timeout_ms
        && a.retry == b.retry
        && a_resources == b_resources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::ResourceRequirement;
    use serde_json::json;
    use std::time::Duration;

    fn batch_options(handlers: &[&str], size: usize) -> OptimizerOptions {
        OptimizerOptions::new(handlers.iter().map(|h| h.to_string()).collect(), size)
    }

    /// A step whose failure does not stop the workflow.
    fn loose(handler: &str) -> StepSpec {
        StepSpec::new(handler).critical(false)
    }

    fn sorted(mut order: Vec<usize>) -> Vec<usize> {
        order.sort();
        order
    }

    #[test]
    fn test_sequential_plan() {
        let steps = vec![StepSpec::new("a"), StepSpec::new("b"), StepSpec::new("a")];
        let plan = ExecutionPlan::sequential(&steps);
        assert_eq!(plan.groups.len(), 3);
        assert_eq!(plan.step_order(), vec![0, 1, 2]);
        assert_eq!(plan.dispatch_count(), 3);
    }

    #[test]
    fn test_empty_steps() {
        let plan = optimize(&[], &OptimizerOptions::default());
        assert!(plan.groups.is_empty());
    }

    #[test]
    fn test_independent_steps_clustered_by_handler() {
        let steps = vec![loose("fetch"), loose("parse"), loose("fetch")];
        let plan = optimize(&steps, &OptimizerOptions::default());
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.step_order(), vec![0, 2, 1]);
    }

    #[test]
    fn test_critical_step_is_barrier() {
        let steps = vec![
            loose("echo").with_id("a"),
            StepSpec::new("fail").with_id("b"),
            loose("echo").with_id("c"),
        ];
        let graph = DependencyGraph::build(&steps);
        assert!(graph.predecessors(1).contains(&0));
        assert!(graph.predecessors(2).contains(&1));

        let plan = optimize(&steps, &batch_options(&["echo"], 4));
        assert_eq!(plan.step_order(), vec![0, 1, 2]);
        assert_eq!(plan.groups.len(), 3);
        assert_eq!(plan.dispatch_count(), 3);
    }

    #[test]
    fn test_default_steps_keep_declared_order() {
        let steps = vec![
            StepSpec::new("fetch"),
            StepSpec::new("parse"),
            StepSpec::new("fetch"),
        ];
        let plan = optimize(&steps, &batch_options(&["fetch"], 4));
        assert_eq!(plan.step_order(), vec![0, 1, 2]);
        assert_eq!(plan.groups.len(), 3);
    }

    #[test]
    fn test_loose_steps_reorder_only_between_barriers() {
        let steps = vec![
            loose("fetch"),
            loose("parse"),
            loose("fetch"),
            StepSpec::new("store"),
            loose("parse"),
            loose("fetch"),
        ];
        let plan = optimize(&steps, &OptimizerOptions::default());
        assert_eq!(plan.step_order(), vec![0, 2, 1, 3, 4, 5]);
    }

    #[test]
    fn test_dependencies_keep_order() {
        let steps = vec![
            loose("fetch").with_id("a"),
            loose("parse").with_id("b").depends_on("a"),
            loose("fetch").with_id("c"),
            loose("store").with_input("data", json!("${steps.b}")),
        ];
        let plan = optimize(&steps, &OptimizerOptions::default());

        let order = plan.step_order();
        let pos = |i: usize| order.iter().position(|&s| s == i).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(3));
        assert_eq!(plan.groups.len(), 3);
    }

    #[test]
    fn test_shared_exclusive_resource_is_ordering_edge() {
        let steps = vec![
            loose("write").with_exclusive_resource("repo:x"),
            loose("read"),
            loose("write").with_exclusive_resource("repo:x"),
        ];
        let graph = DependencyGraph::build(&steps);
        assert!(graph.predecessors(2).contains(&0));
        assert!(graph.predecessors(1).is_empty());

        let plan = optimize(&steps, &batch_options(&["write"], 4));
        let order = plan.step_order();
        let pos = |i: usize| order.iter().position(|&s| s == i).unwrap();
        assert!(pos(0) < pos(2));
        // Steps in different groups are never merged
        assert!(plan.groups.iter().all(|g| g.dispatches.iter().all(|d| !d.is_batch())));
    }

    #[test]
    fn test_batching_merges_adjacent_compatible_steps() {
        let steps = vec![
            loose("http").with_input("url", json!("a")),
            loose("http").with_input("url", json!("b")),
            loose("http").with_input("url", json!("c")),
            loose("log"),
        ];
        let plan = optimize(&steps, &batch_options(&["http"], 2));

        let dispatches = &plan.groups[0].dispatches;
        assert_eq!(dispatches[0].steps, vec![0, 1]);
        assert_eq!(dispatches[1].steps, vec![2]);
        assert_eq!(dispatches[2].steps, vec![3]);
        assert_eq!(plan.step_count(), 4);
    }

    #[test]
    fn test_batching_requires_batch_capability() {
        let steps = vec![loose("http"), loose("http")];
        let plan = optimize(&steps, &batch_options(&["other"], 8));
        assert_eq!(plan.dispatch_count(), 2);
    }

    #[test]
    fn test_incompatible_steps_not_merged() {
        let steps = vec![
            loose("http"),
            loose("http").cacheable(false),
            loose("http").with_resource(ResourceRequirement::counted("net", 1)),
            loose("http").with_timeout(Duration::from_millis(500)),
        ];
        let plan = optimize(&steps, &batch_options(&["http"], 8));
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.dispatch_count(), 4);
    }

    #[test]
    fn test_optimizer_is_deterministic_and_preserves_steps() {
        let steps = vec![
            loose("b").with_id("s0"),
            loose("a").with_id("s1"),
            loose("b").with_id("s2").depends_on("s1"),
            StepSpec::new("a").with_exclusive_resource("lock"),
            loose("c").with_exclusive_resource("lock"),
            loose("a").with_input("x", json!("${steps.s0}")),
        ];
        let options = batch_options(&["a", "b"], 3);

        let first = optimize(&steps, &options);
        let second = optimize(&steps, &options);
        assert_eq!(first, second);

        assert_eq!(sorted(first.step_order()), (0..steps.len()).collect::<Vec<_>>());

        let graph = DependencyGraph::build(&steps);
        let order = first.step_order();
        for later in 0..steps.len() {
            for &earlier in graph.predecessors(later) {
                let pos_later = order.iter().position(|&s| s == later).unwrap();
                let pos_earlier = order.iter().position(|&s| s == earlier).unwrap();
                assert!(pos_earlier < pos_later, "{} must precede {}", earlier, later);
            }
        }
    }

    #[test]
    fn test_transitive_dependency() {
        let steps = vec![
            loose("a").with_id("one"),
            loose("a").with_id("two").depends_on("one"),
            loose("a").with_id("three").depends_on("two"),
        ];
        let graph = DependencyGraph::build(&steps);
        assert!(graph.must_follow(2, 0));
        assert!(!graph.must_follow(0, 2));
        assert_eq!(graph.levels(), vec![0, 1, 2]);
    }

    #[test]
    fn test_plan_display() {
        let steps = vec![loose("http"), loose("http")];
        let plan = optimize(&steps, &batch_options(&["http"], 2));
        let text = plan.to_string();
        assert!(text.contains("group 0"));
        assert!(text.contains("batch http [0, 1]"));
    }
}

//! Workflow Data Model
//!
//! Core data structures describing a workflow submitted for execution.
//! Definitions are immutable once submitted; the scheduler wraps them in an
//! `Arc` and never hands out mutable access.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: nightly-sync
//! name: Nightly repository sync
//! version: "1.2"
//! options:
//!   strategy: optimized
//!   priority: high
//!   timeout_ms: 600000
//! steps:
//!   - id: checkout
//!     handler: shell
//!     inputs:
//!       command: git pull
//!     resources:
//!       - name: repo:main
//!         exclusive: true
//!
//!   - id: report
//!     handler: echo
//!     inputs:
//!       summary: ${steps.checkout}
//!     critical: false
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of an input value that refers to another step's output.
const STEP_REF_PREFIX: &str = "${steps.";
const STEP_REF_SUFFIX: &str = "}";

/// Priority class of a workflow execution. Higher classes are admitted first.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("Unknown priority: {}", other)),
        }
    }
}

/// Execution strategy selectable per workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Declared order, no cache, no reordering
    Basic,
    /// Optimizer plan plus execution cache
    Optimized,
    /// Optimized plus duration/failure aware resource timing
    Smart,
}

impl Default for StrategyKind {
    fn default() -> Self {
        StrategyKind::Optimized
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Basic => "basic",
            StrategyKind::Optimized => "optimized",
            StrategyKind::Smart => "smart",
        };
        f.write_str(name)
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" | "simple" => Ok(StrategyKind::Basic),
            "optimized" | "batch" => Ok(StrategyKind::Optimized),
            "smart" => Ok(StrategyKind::Smart),
            other => Err(format!("Unknown strategy: {}", other)),
        }
    }
}

/// Retry behaviour for a single step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Growth factor applied to the delay after each attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for a single delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl RetryPolicy {
    /// A policy that attempts the step `max_attempts` times with the default backoff.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let millis = (self.backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// A named resource a step needs while it runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRequirement {
    /// Resource name, e.g. `browser` or `repo:/srv/app`
    pub name: String,

    /// Units of capacity needed (ignored for exclusive locks)
    #[serde(default = "default_amount")]
    pub amount: u64,

    /// Whether the resource must be held exclusively
    #[serde(default)]
    pub exclusive: bool,
}

fn default_amount() -> u64 {
    1
}

impl ResourceRequirement {
    /// A counted requirement against a capacity pool.
    pub fn counted(name: impl Into<String>, amount: u64) -> Self {
        Self {
            name: name.into(),
            amount,
            exclusive: false,
        }
    }

    /// An exclusive lock on a named resource.
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            amount: 1,
            exclusive: true,
        }
    }
}

/// One unit of work within a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepSpec {
    /// Optional identifier, required when other steps refer to this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Handler type this step dispatches to
    pub handler: String,

    /// Opaque input parameters passed to the handler
    #[serde(default = "empty_inputs")]
    pub inputs: Value,

    /// IDs of earlier steps whose completion this step requires
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Per-step handler timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Resources held while the step runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRequirement>,

    /// A failed critical step aborts the remaining workflow
    #[serde(default = "default_critical")]
    pub critical: bool,

    /// Whether successful results may be served from the execution cache
    #[serde(default)]
    pub cacheable: bool,
}

fn empty_inputs() -> Value {
    Value::Object(Map::new())
}

fn default_critical() -> bool {
    true
}

impl StepSpec {
    /// Creates a critical, non-cacheable step for a handler type.
    ///
    /// # Example
    ///
    /// ```
    /// use seqflow::workflow::StepSpec;
    /// use serde_json::json;
    ///
    /// let step = StepSpec::new("shell")
    ///     .with_id("build")
    ///     .with_inputs(json!({"command": "make"}))
    ///     .with_exclusive_resource("repo:main");
    /// assert_eq!(step.key(0), "build");
    /// ```
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            id: None,
            handler: handler.into().trim().to_string(),
            inputs: empty_inputs(),
            depends_on: Vec::new(),
            timeout_ms: None,
            retry: None,
            resources: Vec::new(),
            critical: true,
            cacheable: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into().trim().to_string());
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        if !self.inputs.is_object() {
            self.inputs = empty_inputs();
        }
        if let Value::Object(map) = &mut self.inputs {
            map.insert(key.into(), value);
        }
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_resource(mut self, requirement: ResourceRequirement) -> Self {
        self.resources.push(requirement);
        self
    }

    pub fn with_exclusive_resource(self, name: impl Into<String>) -> Self {
        self.with_resource(ResourceRequirement::exclusive(name))
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Stable key of this step: its id, or `#<index>` for anonymous steps.
    pub fn key(&self, index: usize) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("#{}", index),
        }
    }

    /// The input parameters as a map (empty when inputs are not an object).
    pub fn input_map(&self) -> Map<String, Value> {
        match &self.inputs {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Ids of steps whose outputs this step consumes through `${steps.<id>}`.
    pub fn referenced_steps(&self) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        collect_references(&self.inputs, &mut refs);
        refs
    }

    /// All step ids this step must run after: explicit plus referenced.
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps = self.referenced_steps();
        deps.extend(self.depends_on.iter().cloned());
        deps
    }

    /// Names of resources this step locks exclusively.
    pub fn exclusive_resources(&self) -> BTreeSet<&str> {
        self.resources
            .iter()
            .filter(|r| r.exclusive)
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Returns the step id when `value` is exactly a `${steps.<id>}` reference.
pub fn step_reference(value: &Value) -> Option<&str> {
    let text = value.as_str()?.trim();
    text.strip_prefix(STEP_REF_PREFIX)?
        .strip_suffix(STEP_REF_SUFFIX)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

fn collect_references(value: &Value, refs: &mut BTreeSet<String>) {
    if let Some(id) = step_reference(value) {
        refs.insert(id.to_string());
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, refs)),
        _ => {}
    }
}

/// Workflow-level execution options.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecutionOptions {
    /// Strategy hint; the engine default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,

    #[serde(default)]
    pub priority: Priority,

    /// Deadline for the whole execution in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// An ordered list of steps submitted as one unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub steps: Vec<StepSpec>,

    #[serde(default)]
    pub options: ExecutionOptions,
}

fn default_version() -> String {
    "1".to_string()
}

impl WorkflowDefinition {
    /// Creates an empty workflow definition.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into().trim().to_string();
        Self {
            name: id.clone(),
            id,
            version: default_version(),
            steps: Vec::new(),
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.options.strategy = Some(strategy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Index of the step with the given id.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.id.as_deref() == Some(id))
    }

    /// Unique handler types used by this workflow, sorted.
    pub fn handler_types(&self) -> Vec<String> {
        let set: BTreeSet<_> = self.steps.iter().map(|s| s.handler.clone()).collect();
        set.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_creation() {
        let step = StepSpec::new(" shell ")
            .with_id("build")
            .with_input("command", json!("make"))
            .with_timeout(Duration::from_secs(5))
            .critical(false);

        assert_eq!(step.handler, "shell");
        assert_eq!(step.key(3), "build");
        assert_eq!(step.timeout(), Some(Duration::from_secs(5)));
        assert!(!step.critical);
        assert_eq!(step.input_map().get("command"), Some(&json!("make")));
    }

    #[test]
    fn test_anonymous_step_key() {
        let step = StepSpec::new("echo");
        assert_eq!(step.key(2), "#2");
    }

    #[test]
    fn test_step_reference_parsing() {
        assert_eq!(step_reference(&json!("${steps.fetch}")), Some("fetch"));
        assert_eq!(step_reference(&json!(" ${steps. fetch } ")), Some("fetch"));
        assert_eq!(step_reference(&json!("${steps.}")), None);
        assert_eq!(step_reference(&json!("prefix ${steps.fetch}")), None);
        assert_eq!(step_reference(&json!(42)), None);
    }

    #[test]
    fn test_nested_references_become_dependencies() {
        let step = StepSpec::new("echo")
            .with_inputs(json!({
                "a": "${steps.one}",
                "nested": {"list": ["${steps.two}", "literal"]}
            }))
            .depends_on("three");

        let refs = step.referenced_steps();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains("one"));
        assert!(refs.contains("two"));

        let deps = step.dependencies();
        assert_eq!(deps.len(), 3);
        assert!(deps.contains("three"));
    }

    #[test]
    fn test_retry_backoff_growth() {
        let policy = RetryPolicy::attempts(4).with_backoff(Duration::from_millis(10));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
    }

    #[test]
    fn test_retry_backoff_capped() {
        let mut policy = RetryPolicy::attempts(10);
        policy.backoff_ms = 1_000;
        policy.max_backoff_ms = 1_500;
        assert_eq!(policy.backoff_for(5), Duration::from_millis(1_500));
    }

    #[test]
    fn test_step_yaml_defaults() {
        let step: StepSpec = serde_yaml::from_str("handler: echo").unwrap();
        assert!(step.critical);
        assert!(!step.cacheable);
        assert!(step.inputs.is_object());
        assert!(step.retry.is_none());
    }

    #[test]
    fn test_resource_requirement_defaults() {
        let req: ResourceRequirement = serde_yaml::from_str("name: browser").unwrap();
        assert_eq!(req.amount, 1);
        assert!(!req.exclusive);
    }

    #[test]
    fn test_priority_ordering_and_parsing() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_strategy_parsing_aliases() {
        assert_eq!("simple".parse::<StrategyKind>().unwrap(), StrategyKind::Basic);
        assert_eq!("batch".parse::<StrategyKind>().unwrap(), StrategyKind::Optimized);
        assert_eq!("smart".parse::<StrategyKind>().unwrap(), StrategyKind::Smart);
    }

    #[test]
    fn test_workflow_builder() {
        let workflow = WorkflowDefinition::new("wf")
            .with_step(StepSpec::new("echo").with_id("a"))
            .with_step(StepSpec::new("shell").with_id("b"))
            .with_step(StepSpec::new("echo"))
            .with_priority(Priority::High);

        assert_eq!(workflow.len(), 3);
        assert_eq!(workflow.step_index("b"), Some(1));
        assert_eq!(workflow.handler_types(), vec!["echo", "shell"]);
        assert_eq!(workflow.options.priority, Priority::High);
    }

    #[test]
    fn test_exclusive_resources() {
        let step = StepSpec::new("shell")
            .with_exclusive_resource("repo:x")
            .with_resource(ResourceRequirement::counted("cpu", 2));
        let exclusive = step.exclusive_resources();
        assert_eq!(exclusive.len(), 1);
        assert!(exclusive.contains("repo:x"));
    }
}

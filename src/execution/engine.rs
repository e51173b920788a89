//! Sequential Execution Engine
//!
//! Runs the steps of one workflow execution, strictly one dispatch at a
//! time, in the order the execution's strategy plans them.
//!
//! For every dispatch the engine:
//! 1. resolves the handler through the registry
//! 2. acquires the declared resources (bounded wait)
//! 3. consults the execution cache
//! 4. invokes the handler under a timeout
//! 5. writes successful cacheable results through to the cache
//! 6. releases the resources on every exit path
//! 7. appends one [`StepResult`] per step to the execution
//!
//! Retryable failures are retried with backoff according to the step's
//! retry policy. The first failed critical step aborts the run.
//! Cancellation is checked between dispatches only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::cache::{ExecutionCache, Fingerprint};
use crate::config::{CacheConfig, EngineSettings};
use crate::error::{Result, StepError, StepErrorKind};
use crate::handlers::{HandlerContext, HandlerRegistry, HandlerResult, ResolvedHandler};
use crate::monitoring::{EventSink, ExecutionEvent, ExecutionMonitor};
use crate::resources::{AllocationGuard, ResourceManager};
use crate::util::millis;
use crate::workflow::{
    step_reference, Dispatch, ExecutionGroup, ExecutionPlan, ExecutionStatus, RetryPolicy,
    StepResult, StepSpec, StrategyKind, WorkflowDefinition, WorkflowExecution,
};

use super::handle::ExecutionHandle;
use super::strategy::{strategy_for, ExecutionStrategy, PlanningContext};

/// Per-run state shared by every dispatch of one execution.
struct RunContext<'a> {
    handle: &'a ExecutionHandle,
    definition: &'a WorkflowDefinition,
    strategy: &'a dyn ExecutionStrategy,
    deadline: Option<Instant>,
    /// Whether a group lease already covers the current group's resources
    leased: bool,
}

impl RunContext<'_> {
    fn execution_id(&self) -> &str {
        self.handle.id()
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }
}

/// One step of a dispatch while it is being worked on.
struct Member<'a> {
    index: usize,
    key: String,
    step: &'a StepSpec,
    inputs: Map<String, Value>,
    fingerprint: Option<Fingerprint>,
    flagged: bool,
    attempts: u32,
    duration_ms: u64,
    started_at: DateTime<Utc>,
    last_error: Option<StepError>,
    outcome: Option<StepResult>,
}

impl Member<'_> {
    fn fail(&mut self, error: StepError) {
        let result = StepResult::failed(self.index, self.key.clone(), self.step.handler.clone(), error)
            .with_attempts(self.attempts);
        self.outcome = Some(result);
    }
}

/// Executes workflow steps one dispatch at a time.
pub struct SequentialEngine {
    registry: Arc<HandlerRegistry>,
    resources: ResourceManager,
    cache: Arc<ExecutionCache>,
    monitor: Arc<ExecutionMonitor>,
    sinks: Vec<Arc<dyn EventSink>>,
    settings: EngineSettings,
    cache_config: CacheConfig,
}

impl SequentialEngine {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        resources: ResourceManager,
        cache: Arc<ExecutionCache>,
        monitor: Arc<ExecutionMonitor>,
        settings: EngineSettings,
        cache_config: CacheConfig,
    ) -> Self {
        Self {
            registry,
            resources,
            cache,
            monitor,
            sinks: Vec::new(),
            settings,
            cache_config,
        }
    }

    /// Adds a consumer of execution events.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<ExecutionCache> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<ExecutionMonitor> {
        &self.monitor
    }

    /// Strategy a workflow runs under when submitted without an override.
    pub fn strategy_kind(&self, definition: &WorkflowDefinition) -> StrategyKind {
        definition
            .options
            .strategy
            .unwrap_or(self.settings.default_strategy)
    }

    /// The plan a workflow would run under, without running it.
    pub fn plan(&self, definition: &WorkflowDefinition, kind: StrategyKind) -> ExecutionPlan {
        strategy_for(kind, &self.settings.smart).plan(&definition.steps, &self.planning_context())
    }

    fn planning_context(&self) -> PlanningContext {
        PlanningContext {
            batchable: self.registry.batchable_types(),
            max_batch_size: self.settings.max_batch_size,
        }
    }

    /// Publishes an event to every sink.
    pub fn emit(&self, event: ExecutionEvent) {
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }

    /// Runs a queued execution to a terminal state.
    ///
    /// Step failures are recorded on the execution, not returned. An error
    /// means the execution record itself could not be updated.
    pub async fn run(&self, handle: &ExecutionHandle) -> Result<WorkflowExecution> {
        let definition = Arc::clone(handle.definition());
        let kind = handle.update(|execution| execution.strategy);
        let strategy = strategy_for(kind, &self.settings.smart);

        handle.transition(ExecutionStatus::Running)?;
        let started = Instant::now();
        self.emit(ExecutionEvent::Started {
            execution_id: handle.id().to_string(),
            workflow_id: definition.id.clone(),
            strategy: kind,
            step_count: definition.steps.len(),
        });

        let plan = strategy.plan(&definition.steps, &self.planning_context());
        debug!("[{}] Plan:\n{}", handle.id(), plan);

        let mut run = RunContext {
            handle,
            definition: &definition,
            strategy: strategy.as_ref(),
            deadline: definition
                .options
                .timeout_ms
                .map(|ms| started + Duration::from_millis(ms)),
            leased: false,
        };

        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut failure: Option<(Option<String>, StepError)> = None;
        let mut cancelled = false;

        'groups: for group in &plan.groups {
            let lease = self.group_lease(&run, group).await;
            run.leased = lease.is_some();

            for dispatch in &group.dispatches {
                if handle.cancel_token().is_cancelled() {
                    cancelled = true;
                    break 'groups;
                }
                if run.deadline_passed() {
                    let key = dispatch
                        .steps
                        .first()
                        .map(|&index| definition.steps[index].key(index));
                    failure = Some((
                        key,
                        StepError::new(
                            StepErrorKind::WorkflowTimeout,
                            format!(
                                "workflow deadline of {} ms exceeded",
                                definition.options.timeout_ms.unwrap_or_default()
                            ),
                        ),
                    ));
                    break 'groups;
                }

                for result in self.run_dispatch(&run, dispatch, &outputs).await {
                    self.monitor.observe(&result);
                    self.emit(ExecutionEvent::StepCompleted {
                        execution_id: handle.id().to_string(),
                        step_index: result.step_index,
                        step_key: result.step_key.clone(),
                        handler: result.handler.clone(),
                        success: result.success,
                        cache_hit: result.cache_hit,
                        duration_ms: result.duration_ms,
                    });

                    let step = &definition.steps[result.step_index];
                    if result.success {
                        if let (Some(id), Some(output)) = (&step.id, &result.output) {
                            outputs.insert(id.clone(), output.clone());
                        }
                    } else if step.critical && failure.is_none() {
                        let error = result.error.clone().unwrap_or_else(|| {
                            StepError::new(StepErrorKind::HandlerExecution, "step failed")
                        });
                        failure = Some((Some(result.step_key.clone()), error));
                    } else if !step.critical {
                        warn!(
                            "[{}] Non-critical step '{}' failed, continuing",
                            handle.id(),
                            result.step_key
                        );
                    }
                    handle.record_step(result)?;
                }

                if failure.is_some() {
                    break 'groups;
                }
            }
            drop(lease);
        }

        self.finish(handle, started, failure, cancelled)
    }

    fn finish(
        &self,
        handle: &ExecutionHandle,
        started: Instant,
        failure: Option<(Option<String>, StepError)>,
        cancelled: bool,
    ) -> Result<WorkflowExecution> {
        let execution_id = handle.id().to_string();

        if let Some((step_key, error)) = failure {
            let message = error.to_string();
            handle.update(|execution| execution.error = Some(error));
            handle.transition(ExecutionStatus::Failed)?;
            self.emit(ExecutionEvent::Failed {
                execution_id,
                step_key,
                error: message,
            });
        } else if cancelled {
            handle.transition(ExecutionStatus::Cancelled)?;
            self.emit(ExecutionEvent::Cancelled { execution_id });
        } else if handle.settle()? == ExecutionStatus::Cancelled {
            info!("[{}] Cancelled during its last step", execution_id);
            self.emit(ExecutionEvent::Cancelled { execution_id });
        } else {
            self.emit(ExecutionEvent::Completed {
                execution_id,
                duration_ms: millis(started.elapsed()),
            });
        }

        let execution = handle.snapshot();
        info!(
            "[{}] Finished with status {} ({} steps recorded, {} failed)",
            execution.execution_id,
            execution.status,
            execution.step_results.len(),
            execution.failed_steps()
        );
        Ok(execution)
    }

    /// Acquires a group-wide lease when the strategy asks for one.
    ///
    /// Failing to get it is not an error: the group then falls back to
    /// per-step acquisition.
    async fn group_lease(
        &self,
        run: &RunContext<'_>,
        group: &ExecutionGroup,
    ) -> Option<AllocationGuard> {
        let requirements = run
            .strategy
            .group_lease(group, &run.definition.steps, &self.monitor)?;
        let holder = format!("{}/group", run.execution_id());
        match self
            .resources
            .acquire(&requirements, &holder, self.settings.resource_wait())
            .await
        {
            Ok(guard) => {
                debug!(
                    "[{}] Pre-acquired {} resources for the next {} steps",
                    run.execution_id(),
                    guard.set().allocations().len(),
                    group.step_indices().len()
                );
                Some(guard)
            }
            Err(e) => {
                debug!("[{}] Group pre-acquisition skipped: {}", run.execution_id(), e);
                None
            }
        }
    }

    /// Runs one dispatch and returns one result per step, in member order.
    async fn run_dispatch(
        &self,
        run: &RunContext<'_>,
        dispatch: &Dispatch,
        outputs: &HashMap<String, Value>,
    ) -> Vec<StepResult> {
        let execution_id = run.execution_id();
        let mut members: Vec<Member<'_>> = dispatch
            .steps
            .iter()
            .map(|&index| self.prepare_member(run, index, outputs))
            .collect();

        let pending_count = members.iter().filter(|m| m.outcome.is_none()).count();
        if pending_count > 0 {
            match self.registry.resolve(&dispatch.handler) {
                Ok(handler) => self.dispatch_with_retries(run, dispatch, &handler, &mut members).await,
                Err(e) => {
                    warn!("[{}] {}", execution_id, e);
                    let error = StepError::from(&e);
                    for member in members.iter_mut().filter(|m| m.outcome.is_none()) {
                        member.fail(error.clone());
                    }
                }
            }
        }

        let batched = dispatch.is_batch();
        members
            .into_iter()
            .map(|member| {
                let mut result = member.outcome.unwrap_or_else(|| {
                    StepResult::failed(
                        member.index,
                        member.key.clone(),
                        member.step.handler.clone(),
                        StepError::new(StepErrorKind::HandlerExecution, "step produced no result"),
                    )
                });
                result.attempts = member.attempts;
                result.duration_ms = member.duration_ms;
                result.started_at = member.started_at;
                result.batched = batched;
                result.flagged = member.flagged;
                result
            })
            .collect()
    }

    /// Resolves references, applies failure prediction and fingerprints a step.
    fn prepare_member<'a>(
        &self,
        run: &RunContext<'a>,
        index: usize,
        outputs: &HashMap<String, Value>,
    ) -> Member<'a> {
        let definition: &'a WorkflowDefinition = run.definition;
        let step = &definition.steps[index];
        let key = step.key(index);
        let inputs = match resolve_references(&step.inputs, outputs) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let mut member = Member {
            index,
            key,
            step,
            inputs,
            fingerprint: None,
            flagged: false,
            attempts: 0,
            duration_ms: 0,
            started_at: Utc::now(),
            last_error: None,
            outcome: None,
        };

        if let Some(failure_rate) = run.strategy.flag(step, &self.monitor) {
            member.flagged = true;
            self.emit(ExecutionEvent::StepFlagged {
                execution_id: run.execution_id().to_string(),
                step_index: index,
                step_key: member.key.clone(),
                failure_rate,
            });
            if run.strategy.skip_flagged() {
                info!(
                    "[{}] Skipping step '{}' predicted to fail",
                    run.execution_id(),
                    member.key
                );
                member.fail(StepError::new(
                    StepErrorKind::PredictedFailure,
                    format!(
                        "handler '{}' failed {:.0}% of recent dispatches",
                        step.handler,
                        failure_rate * 100.0
                    ),
                ));
            }
        }

        member
    }

    async fn dispatch_with_retries(
        &self,
        run: &RunContext<'_>,
        dispatch: &Dispatch,
        handler: &ResolvedHandler,
        members: &mut [Member<'_>],
    ) {
        let execution_id = run.execution_id();
        let use_cache = self.cache_config.enabled && run.strategy.uses_cache();
        for member in members.iter_mut() {
            if use_cache && member.step.cacheable {
                member.fingerprint = Some(Fingerprint::compute(
                    &handler.handler_type,
                    &handler.version,
                    &member.inputs,
                ));
            }
        }

        // Members of one dispatch share their execution settings
        let Some(first) = members.iter().find(|m| m.outcome.is_none()) else {
            return;
        };
        let policy = first.step.retry.clone().unwrap_or_default();
        let requirements = first.step.resources.clone();
        let max_attempts = policy.max_attempts.max(1);

        for member in members.iter_mut().filter(|m| m.outcome.is_none()) {
            member.started_at = Utc::now();
            self.emit(ExecutionEvent::StepStarted {
                execution_id: execution_id.to_string(),
                step_index: member.index,
                step_key: member.key.clone(),
                handler: dispatch.handler.clone(),
            });
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let pending: Vec<usize> = (0..members.len())
                .filter(|&i| members[i].outcome.is_none())
                .collect();
            if pending.is_empty() {
                break;
            }

            let guard = if run.leased || requirements.is_empty() {
                None
            } else {
                match self
                    .resources
                    .acquire(&requirements, execution_id, self.settings.resource_wait())
                    .await
                {
                    Ok(guard) => Some(guard),
                    Err(e) => {
                        let error = StepError::from(&e);
                        for &i in &pending {
                            members[i].attempts += 1;
                            members[i].last_error = Some(error.clone());
                        }
                        if !self.retry_or_fail(run, &policy, attempt, max_attempts, members).await {
                            break;
                        }
                        continue;
                    }
                }
            };

            let mut to_invoke = Vec::with_capacity(pending.len());
            for &i in &pending {
                let member = &mut members[i];
                member.attempts += 1;
                let hit = member.fingerprint.as_ref().and_then(|fp| self.cache.get(fp));
                match hit {
                    Some(mut cached) => {
                        debug!("[{}] Cache hit for step '{}'", execution_id, member.key);
                        cached.step_index = member.index;
                        cached.step_key = member.key.clone();
                        member.outcome = Some(cached);
                    }
                    None => to_invoke.push(i),
                }
            }

            if !to_invoke.is_empty() {
                self.invoke(run, handler, attempt, &to_invoke, members).await;
            }
            drop(guard);

            if !self.retry_or_fail(run, &policy, attempt, max_attempts, members).await {
                break;
            }
        }
    }

    /// Invokes the handler for the given members and records their outcomes.
    async fn invoke(
        &self,
        run: &RunContext<'_>,
        handler: &ResolvedHandler,
        attempt: u32,
        indices: &[usize],
        members: &mut [Member<'_>],
    ) {
        let contexts: Vec<HandlerContext> = indices
            .iter()
            .map(|&i| {
                let member = &members[i];
                HandlerContext {
                    execution_id: run.execution_id().to_string(),
                    workflow_id: run.definition.id.clone(),
                    step_index: member.index,
                    step_key: member.key.clone(),
                    handler_type: handler.handler_type.clone(),
                    inputs: member.inputs.clone(),
                    attempt,
                }
            })
            .collect();

        let step = members[indices[0]].step;
        let per_step = step.timeout().unwrap_or_else(|| self.settings.step_timeout());
        let requested = per_step.saturating_mul(indices.len() as u32);
        let (limit, capped) = match run.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining < requested {
                    (remaining, true)
                } else {
                    (requested, false)
                }
            }
            None => (requested, false),
        };

        let started = Instant::now();
        let mut contexts = contexts;
        let results: Vec<std::result::Result<Value, StepError>> = if contexts.len() == 1 {
            let ctx = contexts.remove(0);
            match timeout(limit, handler.invoke(ctx)).await {
                Ok(result) => vec![handler_outcome(result)],
                Err(_) => vec![Err(timeout_error(limit, capped))],
            }
        } else {
            let expected = contexts.len();
            match timeout(limit, handler.invoke_batch(contexts)).await {
                Ok(results) if results.len() == expected => {
                    results.into_iter().map(handler_outcome).collect()
                }
                Ok(results) => {
                    let error = StepError::new(
                        StepErrorKind::HandlerExecution,
                        format!("batch returned {} results for {} steps", results.len(), expected),
                    );
                    vec![Err(error); expected]
                }
                Err(_) => vec![Err(timeout_error(limit, capped)); expected],
            }
        };

        let elapsed = millis(started.elapsed());
        let share = elapsed / indices.len().max(1) as u64;

        for (&i, result) in indices.iter().zip(results) {
            let member = &mut members[i];
            member.duration_ms += share;
            match result {
                Ok(output) => {
                    let success = StepResult::succeeded(
                        member.index,
                        member.key.clone(),
                        member.step.handler.clone(),
                        output,
                    )
                    .with_duration_ms(share)
                    .with_attempts(member.attempts);
                    if let Some(fingerprint) = &member.fingerprint {
                        self.cache
                            .put(fingerprint.clone(), success.clone(), self.cache_config.ttl());
                    }
                    member.outcome = Some(success);
                }
                Err(error) => {
                    debug!(
                        "[{}] Step '{}' attempt {} failed: {}",
                        run.execution_id(),
                        member.key,
                        attempt,
                        error
                    );
                    member.last_error = Some(error);
                }
            }
        }
    }

    /// Decides what happens to members still without an outcome.
    ///
    /// Returns true when another attempt should be made, after sleeping the
    /// policy's backoff. Otherwise every remaining member is marked failed.
    async fn retry_or_fail(
        &self,
        run: &RunContext<'_>,
        policy: &RetryPolicy,
        attempt: u32,
        max_attempts: u32,
        members: &mut [Member<'_>],
    ) -> bool {
        let mut retry = false;
        for member in members.iter_mut().filter(|m| m.outcome.is_none()) {
            let error = member.last_error.take().unwrap_or_else(|| {
                StepError::new(StepErrorKind::HandlerExecution, "step failed")
            });
            if error.is_retryable() && attempt < max_attempts && !run.deadline_passed() {
                member.last_error = Some(error);
                retry = true;
            } else {
                member.fail(error);
            }
        }

        if retry {
            let mut backoff = policy.backoff_for(attempt);
            if let Some(deadline) = run.deadline {
                backoff = backoff.min(deadline.saturating_duration_since(Instant::now()));
            }
            info!(
                "[{}] Retrying after {} ms (attempt {} of {})",
                run.execution_id(),
                millis(backoff),
                attempt + 1,
                max_attempts
            );
            tokio::time::sleep(backoff).await;
        }
        retry
    }
}

fn handler_outcome(result: HandlerResult) -> std::result::Result<Value, StepError> {
    result.map_err(|e| StepError::new(StepErrorKind::HandlerExecution, e.to_string()))
}

fn timeout_error(limit: Duration, capped: bool) -> StepError {
    if capped {
        StepError::new(
            StepErrorKind::WorkflowTimeout,
            "workflow deadline reached while the step was running",
        )
    } else {
        StepError::new(
            StepErrorKind::HandlerTimeout,
            format!("handler timed out after {} ms", millis(limit)),
        )
    }
}

/// Replaces every `${steps.<id>}` value with that step's output (or null).
fn resolve_references(value: &Value, outputs: &HashMap<String, Value>) -> Value {
    if let Some(id) = step_reference(value) {
        return outputs.get(id).cloned().unwrap_or(Value::Null);
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_references(item, outputs))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_references(v, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

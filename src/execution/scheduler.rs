//! Execution Scheduler
//!
//! Admits workflow submissions into a bounded priority queue and hands
//! ready executions to the [`SequentialEngine`], each on its own task.
//!
//! Admission capacity lives in the [`ResourceManager`] like any other
//! resource: every running execution holds one unit of the
//! `scheduler.slots` pool, plus one unit of `scheduler.priority.<class>`
//! when that class has a configured cap. The scheduler never counts
//! running executions itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{EngineError, Result, StepError, StepErrorKind};
use crate::handlers::{HandlerClaim, HandlerRegistry};
use crate::monitoring::ExecutionEvent;
use crate::resources::{AllocationGuard, ResourceManager};
use crate::util::lock;
use crate::workflow::parser::populate_dependencies;
use crate::workflow::{
    validate_workflow, ExecutionStatus, Priority, ResourceRequirement, StrategyKind,
    WorkflowDefinition, WorkflowExecution,
};

use super::cancel::CancellationToken;
use super::engine::SequentialEngine;
use super::handle::{CancelRequest, ExecutionHandle};
use super::queue::{ExecutionQueue, QueueEntry};
use super::store::{ExecutionQuery, ExecutionStore};

/// Pool bounding the number of concurrently running executions.
pub const SLOT_POOL: &str = "scheduler.slots";

/// Pool bounding running executions of one priority class.
pub fn priority_pool(priority: Priority) -> String {
    format!("scheduler.priority.{}", priority)
}

/// Per-submission overrides.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub owner: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Overrides the workflow's strategy hint
    pub strategy: Option<StrategyKind>,
    /// Overrides the workflow's priority
    pub priority: Option<Priority>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Answer to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// Removed from the queue before it started
    Cancelled,
    /// Running; stops before its next step
    Cancelling,
    AlreadyFinished,
}

struct SchedulerInner {
    engine: Arc<SequentialEngine>,
    registry: Arc<HandlerRegistry>,
    resources: ResourceManager,
    store: Arc<dyn ExecutionStore>,
    queue: Mutex<ExecutionQueue>,
    /// Queued and running executions. Lock order: `queue`, `live`, `claims`.
    live: Mutex<HashMap<String, Arc<ExecutionHandle>>>,
    /// Handler types each unfinished execution will dispatch
    claims: Mutex<HashMap<String, HandlerClaim>>,
    running: AtomicUsize,
    wake: Notify,
    shutdown: CancellationToken,
    config: SchedulerConfig,
}

/// Admission, ordering and dispatch of workflow executions.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Creates a scheduler and defines its admission pools.
    pub fn new(
        engine: Arc<SequentialEngine>,
        registry: Arc<HandlerRegistry>,
        resources: ResourceManager,
        store: Arc<dyn ExecutionStore>,
        config: SchedulerConfig,
    ) -> Self {
        resources.define_pool(SLOT_POOL, Some(config.max_concurrent));
        for (priority, limit) in &config.priority_limits {
            resources.define_pool(priority_pool(*priority), Some(*limit));
        }

        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                registry,
                resources,
                store,
                queue: Mutex::new(ExecutionQueue::new(config.queue_capacity)),
                live: Mutex::new(HashMap::new()),
                claims: Mutex::new(HashMap::new()),
                running: AtomicUsize::new(0),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                config,
            }),
        }
    }

    pub fn submit(&self, definition: WorkflowDefinition) -> Result<String> {
        self.submit_with(definition, SubmitOptions::default())
    }

    /// Validates and enqueues a workflow, returning the new execution id.
    ///
    /// Nothing is recorded when validation fails or the queue is full.
    pub fn submit_with(
        &self,
        mut definition: WorkflowDefinition,
        options: SubmitOptions,
    ) -> Result<String> {
        populate_dependencies(&mut definition);
        validate_workflow(&definition, &self.inner.registry)?;

        let engine = &self.inner.engine;
        let strategy = options
            .strategy
            .unwrap_or_else(|| engine.strategy_kind(&definition));
        let priority = options.priority.unwrap_or(definition.options.priority);

        let execution_id = Uuid::new_v4().to_string();
        let mut execution = WorkflowExecution::new(&execution_id, &definition, strategy, priority);
        execution.owner = options.owner;
        execution.metadata = options.metadata;
        execution.estimated_duration_ms = engine.monitor().estimate_workflow(&definition);

        let workflow_id = definition.id.clone();
        let claim = self
            .inner
            .registry
            .claim(definition.steps.iter().map(|step| step.handler.as_str()));
        let handle = Arc::new(ExecutionHandle::new(execution, Arc::new(definition)));
        {
            let mut queue = lock(&self.inner.queue);
            queue.push(execution_id.clone(), priority)?;
            lock(&self.inner.live).insert(execution_id.clone(), handle);
            lock(&self.inner.claims).insert(execution_id.clone(), claim);
        }

        info!(
            "Queued execution {} of workflow '{}' (priority {}, strategy {})",
            execution_id, workflow_id, priority, strategy
        );
        self.inner.wake.notify_one();
        Ok(execution_id)
    }

    /// Starts every queued execution that can be admitted right now.
    ///
    /// Returns the number of executions started.
    pub fn dispatch_ready(&self) -> usize {
        let mut started = 0;
        loop {
            let admitted = {
                let mut queue = lock(&self.inner.queue);
                let mut chosen = None;
                for entry in queue.iter() {
                    match self.try_admit(entry) {
                        Ok(Some(slots)) => {
                            chosen = Some((entry.execution_id.clone(), slots));
                            break;
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Cannot admit {}: {}", entry.execution_id, e),
                    }
                }
                if let Some((execution_id, _)) = &chosen {
                    queue.remove(execution_id);
                }
                chosen
            };

            let Some((execution_id, slots)) = admitted else {
                break;
            };
            let handle = lock(&self.inner.live).get(&execution_id).cloned();
            match handle {
                Some(handle) => {
                    self.spawn_run(handle, slots);
                    started += 1;
                }
                None => warn!("Execution {} vanished before it started", execution_id),
            }
        }
        started
    }

    fn try_admit(&self, entry: &QueueEntry) -> Result<Option<AllocationGuard>> {
        let mut requirements = vec![ResourceRequirement::counted(SLOT_POOL, 1)];
        if self.inner.config.priority_limits.contains_key(&entry.priority) {
            requirements.push(ResourceRequirement::counted(priority_pool(entry.priority), 1));
        }
        self.inner
            .resources
            .try_acquire(&requirements, &entry.execution_id)
    }

    fn spawn_run(&self, handle: Arc<ExecutionHandle>, slots: AllocationGuard) {
        let scheduler = self.clone();
        scheduler.inner.running.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Dispatching execution {} of workflow '{}'",
            handle.id(),
            handle.definition().id
        );

        tokio::spawn(async move {
            let inner = &scheduler.inner;
            if let Err(e) = inner.engine.run(&handle).await {
                error!("Execution {} aborted: {}", handle.id(), e);
                handle.update(|execution| {
                    execution.error = Some(StepError::new(StepErrorKind::HandlerExecution, e.to_string()))
                });
                if let Err(e) = handle.transition(ExecutionStatus::Failed) {
                    warn!("Execution {} left in {}: {}", handle.id(), handle.status(), e);
                }
            }

            if let Err(e) = inner.store.save(&handle.snapshot()) {
                warn!("Failed to store execution {}: {}", handle.id(), e);
            }
            lock(&inner.live).remove(handle.id());
            lock(&inner.claims).remove(handle.id());
            drop(slots);
            inner.running.fetch_sub(1, Ordering::SeqCst);
            inner.wake.notify_one();
        });
    }

    /// Cancels a queued or running execution.
    pub fn cancel(&self, execution_id: &str) -> Result<CancelAck> {
        let dequeued = lock(&self.inner.queue).remove(execution_id).is_some();
        if dequeued {
            let handle = lock(&self.inner.live).remove(execution_id);
            lock(&self.inner.claims).remove(execution_id);
            if let Some(handle) = handle {
                handle.request_cancel()?;
                handle.transition(ExecutionStatus::Cancelled)?;
                self.inner.engine.emit(ExecutionEvent::Cancelled {
                    execution_id: execution_id.to_string(),
                });
                if let Err(e) = self.inner.store.save(&handle.snapshot()) {
                    warn!("Failed to store execution {}: {}", execution_id, e);
                }
            }
            info!("Cancelled queued execution {}", execution_id);
            return Ok(CancelAck::Cancelled);
        }

        let handle = lock(&self.inner.live).get(execution_id).cloned();
        match handle {
            Some(handle) => match handle.request_cancel()? {
                CancelRequest::Queued | CancelRequest::Cancelling => {
                    info!("Cancellation requested for execution {}", execution_id);
                    Ok(CancelAck::Cancelling)
                }
                CancelRequest::AlreadyFinished => Ok(CancelAck::AlreadyFinished),
            },
            None if self.inner.store.get(execution_id)?.is_some() => Ok(CancelAck::AlreadyFinished),
            None => Err(EngineError::ExecutionNotFound(execution_id.to_string())),
        }
    }

    /// Current snapshot of a queued, running or finished execution.
    pub fn status(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let handle = lock(&self.inner.live).get(execution_id).cloned();
        if let Some(handle) = handle {
            return Ok(handle.snapshot());
        }
        self.inner
            .store
            .get(execution_id)?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Waits up to `timeout` for an execution to finish.
    ///
    /// Returns the latest snapshot, which is still non-terminal on timeout.
    pub async fn wait(&self, execution_id: &str, timeout: Duration) -> Result<WorkflowExecution> {
        let handle = lock(&self.inner.live).get(execution_id).cloned();
        match handle {
            Some(handle) => {
                if handle.wait_terminal(timeout).await.is_none() {
                    debug!("Timed out waiting for execution {}", execution_id);
                }
                Ok(handle.snapshot())
            }
            None => self.status(execution_id),
        }
    }

    /// Finished and live executions matching a query.
    pub fn query(&self, query: &ExecutionQuery) -> Result<Vec<WorkflowExecution>> {
        let mut unbounded = query.clone();
        unbounded.limit = None;

        let mut by_id: HashMap<String, WorkflowExecution> = self
            .inner
            .store
            .query(&unbounded)?
            .into_iter()
            .map(|e| (e.execution_id.clone(), e))
            .collect();
        let live: Vec<Arc<ExecutionHandle>> = lock(&self.inner.live).values().cloned().collect();
        for handle in live {
            let snapshot = handle.snapshot();
            by_id.insert(snapshot.execution_id.clone(), snapshot);
        }

        Ok(query.apply(by_id.into_values()))
    }

    /// Zero-based position of a queued execution.
    pub fn queue_position(&self, execution_id: &str) -> Option<usize> {
        lock(&self.inner.queue).position(execution_id)
    }

    pub fn queued_count(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Spawns the dispatch loop. It wakes on submissions, on finished
    /// executions and every `poll_interval_ms`.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let poll = Duration::from_millis(self.inner.config.poll_interval_ms);
        tokio::spawn(async move {
            info!(
                "Scheduler started (max concurrent: {}, queue capacity: {})",
                scheduler.inner.config.max_concurrent, scheduler.inner.config.queue_capacity
            );
            loop {
                scheduler.dispatch_ready();
                tokio::select! {
                    _ = scheduler.inner.shutdown.cancelled() => break,
                    _ = scheduler.inner.wake.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            info!("Scheduler stopped");
        })
    }

    /// Stops the dispatch loop. Running executions finish normally and
    /// queued ones stay queued.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

//! Runtime wiring
//!
//! Builds every component from one [`EngineConfig`]: handler registry and
//! telemetry, resource pools, cache, history monitor, engine, store and
//! scheduler. Components share state through `Arc`s, so the accessors
//! hand out the same instances the scheduler uses.

use std::sync::Arc;

use log::info;
use tokio::task::JoinHandle;

use crate::cache::ExecutionCache;
use crate::config::{EngineConfig, StoreKind};
use crate::error::Result;
use crate::execution::{
    ExecutionStore, FileExecutionStore, MemoryExecutionStore, Scheduler, SequentialEngine,
};
use crate::handlers::{migrate_legacy_handlers, HandlerRegistry, LegacyHandlerSource, MigrationReport};
use crate::monitoring::{
    EventSink, ExecutionMonitor, HandlerAdvisor, HandlerTelemetry, LogSink, Recommendation,
};
use crate::resources::ResourceManager;

pub struct Runtime {
    config: EngineConfig,
    registry: Arc<HandlerRegistry>,
    telemetry: Arc<HandlerTelemetry>,
    resources: ResourceManager,
    engine: Arc<SequentialEngine>,
    store: Arc<dyn ExecutionStore>,
    scheduler: Scheduler,
}

impl Runtime {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_sinks(config, Vec::new())
    }

    /// Builds a runtime whose engine also reports to `sinks`.
    pub fn with_sinks(config: EngineConfig, sinks: Vec<Arc<dyn EventSink>>) -> Result<Self> {
        config.validate()?;

        let telemetry = Arc::new(HandlerTelemetry::new(config.telemetry.audit_capacity));
        let registry = Arc::new(HandlerRegistry::new().with_telemetry(Arc::clone(&telemetry)));

        let resources = ResourceManager::new();
        for (name, capacity) in &config.resources.pools {
            resources.define_pool(name.as_str(), Some(*capacity));
        }

        let mut engine = SequentialEngine::new(
            Arc::clone(&registry),
            resources.clone(),
            Arc::new(ExecutionCache::new(config.cache.max_entries)),
            Arc::new(ExecutionMonitor::with_smoothing(config.engine.smart.smoothing)),
            config.engine.clone(),
            config.cache.clone(),
        );
        if config.telemetry.log_events {
            engine = engine.with_sink(Arc::new(LogSink));
        }
        for sink in sinks {
            engine = engine.with_sink(sink);
        }
        let engine = Arc::new(engine);

        let store: Arc<dyn ExecutionStore> = match config.store.kind {
            StoreKind::Memory => Arc::new(MemoryExecutionStore::new(config.store.history_limit)),
            StoreKind::File => Arc::new(FileExecutionStore::open(&config.store.directory)?),
        };

        let scheduler = Scheduler::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            resources.clone(),
            Arc::clone(&store),
            config.scheduler.clone(),
        );

        info!(
            "Runtime ready: {} resource pools, {} store, default strategy {}",
            config.resources.pools.len(),
            match config.store.kind {
                StoreKind::Memory => "memory",
                StoreKind::File => "file",
            },
            config.engine.default_strategy
        );

        Ok(Self {
            config,
            registry,
            telemetry,
            resources,
            engine,
            store,
            scheduler,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<HandlerTelemetry> {
        &self.telemetry
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn engine(&self) -> &Arc<SequentialEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Starts the scheduler's dispatch loop.
    pub fn start(&self) -> JoinHandle<()> {
        self.scheduler.start()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Moves handlers from an older registry into this one.
    pub fn migrate(&self, source: &dyn LegacyHandlerSource) -> MigrationReport {
        migrate_legacy_handlers(source, &self.registry)
    }

    /// Optimization hints from the handler metrics collected so far.
    pub fn advisor_report(&self) -> Vec<Recommendation> {
        let telemetry = &self.config.telemetry;
        let advisor = HandlerAdvisor {
            slow_threshold_ms: telemetry.slow_handler_ms,
            faulty_threshold: telemetry.faulty_handler_rate,
            min_invocations: telemetry.advisor_min_invocations,
        };
        advisor.recommend(&self.telemetry.metrics().snapshot(), &self.registry.list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::register_builtin_handlers;
    use crate::monitoring::{MemorySink, RecommendationKind};
    use crate::workflow::{ExecutionStatus, StepSpec, WorkflowDefinition};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    /// The record is stored just after the execution turns terminal.
    async fn stored(runtime: &Runtime, id: &str) -> bool {
        for _ in 0..100 {
            if runtime.store().get(id).unwrap().is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.scheduler.max_concurrent = 0;
        assert!(Runtime::new(config).is_err());
    }

    #[tokio::test]
    async fn test_runs_workflow_with_builtin_handlers() {
        let sink = Arc::new(MemorySink::new());
        let runtime = Runtime::with_sinks(EngineConfig::default(), vec![sink.clone()]).unwrap();
        register_builtin_handlers(runtime.registry()).unwrap();
        runtime.start();

        let definition = WorkflowDefinition::new("greet")
            .with_step(
                StepSpec::new("echo")
                    .with_id("hello")
                    .with_input("greeting", json!("hi")),
            )
            .with_step(StepSpec::new("echo").with_input("copy", json!("${steps.hello}")));
        let id = runtime.scheduler().submit(definition).unwrap();
        let execution = runtime.scheduler().wait(&id, WAIT).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_results.len(), 2);
        assert_eq!(execution.step_results[1].output, Some(json!({"copy": {"greeting": "hi"}})));
        assert!(!sink.for_execution(&id).is_empty());
        assert!(stored(&runtime, &id).await);
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_file_store_keeps_history() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.store.kind = StoreKind::File;
        config.store.directory = dir.path().join("history");

        let runtime = Runtime::new(config).unwrap();
        register_builtin_handlers(runtime.registry()).unwrap();
        runtime.start();

        let id = runtime
            .scheduler()
            .submit(WorkflowDefinition::new("wf").with_step(StepSpec::new("echo")))
            .unwrap();
        runtime.scheduler().wait(&id, WAIT).await.unwrap();
        assert!(stored(&runtime, &id).await);
        runtime.shutdown();

        assert!(dir.path().join("history").join(format!("{}.json", id)).exists());
    }

    #[tokio::test]
    async fn test_advisor_flags_faulty_handler() {
        let mut config = EngineConfig::default();
        config.telemetry.advisor_min_invocations = 2;
        let runtime = Runtime::new(config).unwrap();
        register_builtin_handlers(runtime.registry()).unwrap();
        runtime.start();

        for _ in 0..2 {
            let definition = WorkflowDefinition::new("wf")
                .with_step(StepSpec::new("fail").critical(false));
            let id = runtime.scheduler().submit(definition).unwrap();
            runtime.scheduler().wait(&id, WAIT).await.unwrap();
        }
        runtime.shutdown();

        let report = runtime.advisor_report();
        assert!(report
            .iter()
            .any(|r| r.handler_type == "fail" && r.kind == RecommendationKind::Faulty));
    }
}

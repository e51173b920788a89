//! Handlers and helpers shared by unit tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::handlers::{
    Handler, HandlerContext, HandlerError, HandlerRegistration, HandlerRegistry, HandlerResult,
};

/// A context for a step with the given inputs.
pub(crate) fn context(handler_type: &str, inputs: Value) -> HandlerContext {
    HandlerContext {
        execution_id: "exec-test".to_string(),
        workflow_id: "wf-test".to_string(),
        step_index: 0,
        step_key: "#0".to_string(),
        handler_type: handler_type.to_string(),
        inputs: match inputs {
            Value::Object(map) => map,
            _ => Map::new(),
        },
        attempt: 1,
    }
}

/// A registry holding the given direct handlers.
pub(crate) fn registry_with<H: Handler + 'static>(handlers: &[(&str, Arc<H>)]) -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    for (handler_type, handler) in handlers {
        let handler: Arc<dyn Handler> = handler.clone();
        registry
            .register(HandlerRegistration::direct(*handler_type, handler))
            .unwrap();
    }
    registry
}

/// Echoes its inputs and counts calls.
#[derive(Debug, Default)]
pub(crate) struct RecordingHandler {
    calls: AtomicUsize,
    batches: AtomicUsize,
}

impl RecordingHandler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Steps handled, batched or not.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn batch_calls(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Object(ctx.inputs))
    }

    async fn execute_batch(&self, contexts: Vec<HandlerContext>) -> Vec<HandlerResult> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.calls.fetch_add(contexts.len(), Ordering::SeqCst);
        contexts
            .into_iter()
            .map(|ctx| Ok(Value::Object(ctx.inputs)))
            .collect()
    }
}

/// Always fails.
#[derive(Debug)]
pub(crate) struct FailingHandler {
    message: String,
    calls: AtomicUsize,
}

impl FailingHandler {
    pub(crate) fn new(message: &str) -> Arc<Self> {
        Arc::new(Self {
            message: message.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for FailingHandler {
    async fn execute(&self, _ctx: HandlerContext) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::failed(self.message.clone()))
    }
}

/// Fails a fixed number of times, then echoes its inputs.
#[derive(Debug)]
pub(crate) struct FlakyHandler {
    failures_left: AtomicU32,
    calls: AtomicUsize,
}

impl FlakyHandler {
    pub(crate) fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for FlakyHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            Err(HandlerError::failed(format!("flaky attempt {}", ctx.attempt)))
        } else {
            Ok(Value::Object(ctx.inputs))
        }
    }
}

/// Sleeps for a fixed delay, then echoes its inputs.
#[derive(Debug)]
pub(crate) struct SleepingHandler {
    delay: Duration,
}

impl SleepingHandler {
    pub(crate) fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay })
    }
}

#[async_trait]
impl Handler for SleepingHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult {
        tokio::time::sleep(self.delay).await;
        Ok(Value::Object(ctx.inputs))
    }
}

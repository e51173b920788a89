//! Handler contracts
//!
//! [`Handler`] is the canonical shape every step handler is invoked
//! through. The other traits describe the older shapes that the adapters
//! in [`super::adapters`] bridge to it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Everything a handler learns about the step it runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub step_index: usize,
    pub step_key: String,
    pub handler_type: String,
    /// Step inputs with `${steps.<id>}` references already resolved
    pub inputs: Map<String, Value>,
    /// 1-based attempt number
    pub attempt: u32,
}

impl HandlerContext {
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(Value::as_str)
    }

    pub fn input_u64(&self, key: &str) -> Option<u64> {
        self.inputs.get(key).and_then(Value::as_u64)
    }
}

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("handler crashed: {0}")]
    Crashed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Canonical `execute(context) -> result` contract.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult;

    /// Runs several compatible steps in one dispatch.
    ///
    /// Must return exactly one result per context, in order. The default
    /// runs the contexts one after another.
    async fn execute_batch(&self, contexts: Vec<HandlerContext>) -> Vec<HandlerResult> {
        let mut results = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            results.push(self.execute(ctx).await);
        }
        results
    }
}

/// Positional-argument handler shape: `f(args) -> value`.
///
/// Legacy handlers are synchronous and may block.
pub type LegacyFn = Arc<dyn Fn(Vec<Value>) -> Value + Send + Sync>;

/// Input to a command-bus style handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub payload: Value,
    pub correlation_id: String,
}

/// What a command handler produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Names of domain events raised while handling the command
    #[serde(default)]
    pub events: Vec<String>,
    pub result: Value,
}

impl CommandOutcome {
    pub fn new(result: Value) -> Self {
        Self {
            events: Vec::new(),
            result,
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into());
        self
    }
}

/// Handler originally written for a command bus.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> std::result::Result<CommandOutcome, String>;
}

/// Long-lived service object whose methods act as handlers.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Methods callable through [`Service::call`].
    fn methods(&self) -> Vec<String>;

    async fn call(&self, method: &str, args: Map<String, Value>) -> std::result::Result<Value, String>;
}

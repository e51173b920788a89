//! Handler adapters
//!
//! Each adapter wraps one non-canonical handler shape and exposes it as a
//! [`Handler`]. Translation happens in both directions: the canonical
//! context becomes the legacy call signature, and the legacy return value
//! becomes a [`HandlerResult`].

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::traits::{
    Command, CommandHandler, Handler, HandlerContext, HandlerError, HandlerResult, LegacyFn,
    Service,
};

/// Wraps a positional-argument function.
///
/// Arguments are taken from the context inputs in `arg_order`; a missing
/// input is passed as `null`. The function runs on the blocking pool.
///
/// Return value translation:
/// - an object with `"success": false` is a failure carrying its `error`
///   (or `message`) field
/// - an object with `"success": true` yields its `data` field, or the
///   whole object when there is none
/// - anything else is returned unchanged
pub struct LegacyHandlerAdapter {
    function: LegacyFn,
    arg_order: Vec<String>,
}

impl LegacyHandlerAdapter {
    pub fn new(function: LegacyFn, arg_order: Vec<String>) -> Self {
        Self {
            function,
            arg_order,
        }
    }

    fn arguments(&self, ctx: &HandlerContext) -> Vec<Value> {
        self.arg_order
            .iter()
            .map(|name| ctx.inputs.get(name).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Converts a legacy return value into a canonical result.
pub fn translate_legacy_return(value: Value) -> HandlerResult {
    let success = value
        .as_object()
        .and_then(|object| object.get("success"))
        .and_then(Value::as_bool);

    match (success, value) {
        (Some(false), Value::Object(object)) => {
            let message = object
                .get("error")
                .or_else(|| object.get("message"))
                .map(|detail| match detail {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "legacy handler reported failure".to_string());
            Err(HandlerError::Failed(message))
        }
        (Some(true), Value::Object(mut object)) => {
            object.remove("success");
            Ok(object.remove("data").unwrap_or(Value::Object(object)))
        }
        (_, value) => Ok(value),
    }
}

#[async_trait]
impl Handler for LegacyHandlerAdapter {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult {
        let args = self.arguments(&ctx);
        let function = Arc::clone(&self.function);

        let value = tokio::task::spawn_blocking(move || function(args))
            .await
            .map_err(|e| HandlerError::Crashed(e.to_string()))?;

        translate_legacy_return(value)
    }
}

/// Wraps a command-bus handler.
///
/// The step inputs become the command payload; the correlation id ties the
/// command to the execution, step and attempt.
pub struct CommandHandlerAdapter {
    handler: Arc<dyn CommandHandler>,
    command_name: String,
}

impl CommandHandlerAdapter {
    pub fn new(handler: Arc<dyn CommandHandler>, command_name: impl Into<String>) -> Self {
        Self {
            handler,
            command_name: command_name.into(),
        }
    }
}

#[async_trait]
impl Handler for CommandHandlerAdapter {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult {
        let command = Command {
            name: self.command_name.clone(),
            payload: Value::Object(ctx.inputs),
            correlation_id: format!("{}/{}/{}", ctx.execution_id, ctx.step_key, ctx.attempt),
        };

        let outcome = self
            .handler
            .handle(command)
            .await
            .map_err(HandlerError::Failed)?;

        if !outcome.events.is_empty() {
            debug!(
                "Command '{}' raised events: {}",
                self.command_name,
                outcome.events.join(", ")
            );
        }
        Ok(outcome.result)
    }
}

/// Binds one method of a service object.
pub struct ServiceHandlerAdapter {
    service: Arc<dyn Service>,
    method: String,
}

impl ServiceHandlerAdapter {
    pub fn new(service: Arc<dyn Service>, method: impl Into<String>) -> Self {
        Self {
            service,
            method: method.into(),
        }
    }
}

#[async_trait]
impl Handler for ServiceHandlerAdapter {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult {
        self.service
            .call(&self.method, ctx.inputs)
            .await
            .map_err(|message| {
                HandlerError::Failed(format!("{}.{}: {}", self.service.name(), self.method, message))
            })
    }
}

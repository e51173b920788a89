//! Handler Factory
//!
//! Turns a [`HandlerRegistration`] into the canonical [`Handler`]. This is
//! the only place that branches on [`HandlerKind`]; everything downstream
//! calls the canonical shape.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{EngineError, Result};

use super::adapters::{CommandHandlerAdapter, LegacyHandlerAdapter, ServiceHandlerAdapter};
use super::registry::{HandlerKind, HandlerRegistration};
use super::traits::Handler;

pub struct HandlerFactory;

impl HandlerFactory {
    /// Builds the invocable handler for a registration, wrapping
    /// non-canonical shapes in the matching adapter.
    pub fn create(registration: &HandlerRegistration) -> Result<Arc<dyn Handler>> {
        let mismatch = |reason: String| EngineError::AdapterMismatch {
            handler: registration.handler_type.clone(),
            reason,
        };

        if registration.handler_type.trim().is_empty() {
            return Err(mismatch("handler type is empty".to_string()));
        }

        match &registration.kind {
            HandlerKind::Direct(handler) => Ok(Arc::clone(handler)),

            HandlerKind::Legacy {
                function,
                arg_order,
            } => {
                let mut seen = HashSet::new();
                if let Some(duplicate) = arg_order.iter().find(|name| !seen.insert(name.as_str())) {
                    return Err(mismatch(format!("argument '{}' listed twice", duplicate)));
                }
                Ok(Arc::new(LegacyHandlerAdapter::new(
                    Arc::clone(function),
                    arg_order.clone(),
                )))
            }

            HandlerKind::Command { handler, command } => {
                if command.trim().is_empty() {
                    return Err(mismatch("command name is empty".to_string()));
                }
                Ok(Arc::new(CommandHandlerAdapter::new(
                    Arc::clone(handler),
                    command.clone(),
                )))
            }

            HandlerKind::Service { service, method } => {
                if !service.methods().iter().any(|m| m == method) {
                    return Err(mismatch(format!(
                        "service '{}' has no method '{}'",
                        service.name(),
                        method
                    )));
                }
                Ok(Arc::new(ServiceHandlerAdapter::new(
                    Arc::clone(service),
                    method.clone(),
                )))
            }
        }
    }
}

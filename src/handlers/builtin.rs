//! Built-in handlers
//!
//! Small handlers every runtime ships with:
//!
//! | Type    | Inputs                 | Output                                 |
//! |---------|------------------------|----------------------------------------|
//! | `echo`  | anything               | the inputs object                      |
//! | `sleep` | `ms`                   | `{"slept_ms": ms}`                     |
//! | `fail`  | `message` (optional)   | always fails                           |
//! | `shell` | `command`, `cwd`       | `{"exit_code", "stdout", "stderr"}`    |

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::error::Result;

use super::registry::{HandlerRegistration, HandlerRegistry};
use super::traits::{Handler, HandlerContext, HandlerError, HandlerResult};

/// Returns its inputs unchanged. Supports batched dispatch.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult {
        Ok(Value::Object(ctx.inputs))
    }

    async fn execute_batch(&self, contexts: Vec<HandlerContext>) -> Vec<HandlerResult> {
        contexts
            .into_iter()
            .map(|ctx| Ok(Value::Object(ctx.inputs)))
            .collect()
    }
}

/// Sleeps for `ms` milliseconds.
pub struct SleepHandler;

#[async_trait]
impl Handler for SleepHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult {
        let ms = ctx
            .input_u64("ms")
            .ok_or_else(|| HandlerError::invalid_input("'ms' must be a non-negative integer"))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

/// Always fails, with `message` when given.
pub struct FailHandler;

#[async_trait]
impl Handler for FailHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult {
        let message = ctx.input_str("message").unwrap_or("step failed on purpose");
        Err(HandlerError::failed(message))
    }
}

/// Runs `command` with `bash -c` (with `set -e`), optionally in `cwd`.
///
/// The child is killed if the dispatch is dropped, so a step timeout does
/// not leave the process running.
pub struct ShellHandler;

#[async_trait]
impl Handler for ShellHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerResult {
        let command_text = ctx
            .input_str("command")
            .ok_or_else(|| HandlerError::invalid_input("'command' is required"))?;

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(format!("set -e\n{}", command_text))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = ctx.input_str("cwd") {
            let dir = PathBuf::from(dir);
            debug!("Executing in directory: {}", dir.display());
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| HandlerError::failed(format!("failed to spawn bash: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        if output.status.success() {
            debug!("Step '{}' completed successfully", ctx.step_key);
            return Ok(json!({
                "exit_code": output.status.code().unwrap_or(0),
                "stdout": stdout,
                "stderr": stderr,
            }));
        }

        error!(
            "Step '{}' failed with exit code: {:?}",
            ctx.step_key,
            output.status.code()
        );
        if !stderr.is_empty() {
            error!("stderr:\n{}", stderr);
        }

        let detail = stderr.lines().last().unwrap_or("no output");
        Err(HandlerError::failed(format!(
            "exit code {:?}: {}",
            output.status.code(),
            detail
        )))
    }
}

/// Registers `echo`, `sleep`, `fail` and `shell`.
pub fn register_builtin_handlers(registry: &HandlerRegistry) -> Result<()> {
    registry.register(
        HandlerRegistration::direct("echo", Arc::new(EchoHandler))
            .with_display_name("Echo")
            .with_batch(true),
    )?;
    registry.register(HandlerRegistration::direct("sleep", Arc::new(SleepHandler)).with_display_name("Sleep"))?;
    registry.register(HandlerRegistration::direct("fail", Arc::new(FailHandler)).with_display_name("Fail"))?;
    registry.register(HandlerRegistration::direct("shell", Arc::new(ShellHandler)).with_display_name("Shell"))?;
    Ok(())
}

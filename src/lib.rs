//! SeqFlow - Sequential Workflow Execution Engine
//!
//! Accepts workflow definitions (ordered lists of steps, each naming a
//! handler type), queues them by priority and runs each one step by step
//! under shared resource limits. Handlers of every shape, from plain
//! functions to external services, run behind one uniform contract.
//!
//! # Architecture
//!
//! - [`workflow`]: definitions, parsing, validation, execution records and
//!   the plan optimizer
//! - [`execution`]: scheduler, engine and strategies
//! - [`handlers`]: the unified handler contract, registry and migration
//! - [`resources`]: named resource pools and leases
//! - [`cache`]: fingerprinted step result cache
//! - [`monitoring`]: events, timelines, handler metrics and history
//! - [`runtime`]: wires everything from one [`EngineConfig`]
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use seqflow::{register_builtin_handlers, EngineConfig, Runtime};
//! use seqflow::workflow::{StepSpec, WorkflowDefinition};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::new(EngineConfig::discover()?)?;
//!     register_builtin_handlers(runtime.registry())?;
//!     runtime.start();
//!
//!     let workflow = WorkflowDefinition::new("hello")
//!         .with_step(StepSpec::new("echo").with_id("greet"))
//!         .with_step(StepSpec::new("shell").with_input("command", "echo done".into()));
//!     let id = runtime.scheduler().submit(workflow)?;
//!     let execution = runtime.scheduler().wait(&id, Duration::from_secs(30)).await?;
//!     println!("{}: {}", execution.execution_id, execution.status);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod handlers;
pub mod monitoring;
pub mod resources;
pub mod runtime;
pub mod workflow;

mod util;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, Result, StepError, StepErrorKind};
pub use execution::{CancelAck, ExecutionQuery, Scheduler, SubmitOptions};
pub use handlers::{register_builtin_handlers, Handler, HandlerContext, HandlerRegistry};
pub use runtime::Runtime;
pub use workflow::{load_workflow, ExecutionStatus, StepSpec, WorkflowDefinition, WorkflowExecution};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "SeqFlow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "SeqFlow");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowDefinition::new("wf").with_step(StepSpec::new("echo"));
        assert_eq!(workflow.id, "wf");
        assert_eq!(workflow.steps.len(), 1);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}

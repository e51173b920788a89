//! Workflow Execution Module
//!
//! Everything between a submitted workflow and its finished record.
//!
//! # Architecture
//!
//! - [`scheduler`]: admission queue, priority ordering and dispatch
//! - [`engine`]: runs one execution's plan step by step
//! - [`strategy`]: basic, optimized and smart planning policies
//! - [`handle`]: shared, status-checked view of one execution
//! - [`queue`]: bounded priority queue of waiting executions
//! - [`store`]: history of finished executions
//! - [`cancel`]: cooperative cancellation token

pub mod cancel;
pub mod engine;
pub mod handle;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod strategy;

pub use cancel::CancellationToken;
pub use engine::SequentialEngine;
pub use handle::{CancelRequest, ExecutionHandle};
pub use queue::{ExecutionQueue, QueueEntry};
pub use scheduler::{CancelAck, Scheduler, SubmitOptions};
pub use store::{ExecutionQuery, ExecutionStore, FileExecutionStore, MemoryExecutionStore};
pub use strategy::{
    strategy_for, BasicStrategy, ExecutionStrategy, OptimizedStrategy, PlanningContext,
    SmartStrategy,
};

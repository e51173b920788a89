//! Resource Management Module
//!
//! Tracks concurrent resource usage across executions: counted pools such
//! as browser sessions, and exclusive locks such as one per repository.
//!
//! - [`manager`]: the [`ResourceManager`] arbiter and its RAII lease guard
//! - [`allocation`]: lease and utilization value types

pub mod allocation;
pub mod manager;

pub use allocation::{AllocationSet, PoolUsage, ResourceAllocation, UtilizationSnapshot};
pub use manager::{AllocationGuard, ResourceManager};

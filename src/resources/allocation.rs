//! Resource Leases
//!
//! Value types describing granted resources and pool utilization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single grant of one resource to one holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceAllocation {
    pub resource: String,
    pub amount: u64,
    pub exclusive: bool,
    /// Execution id of the holder
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// All allocations granted by one acquire call.
///
/// Clones share the release flag, so releasing any clone releases the set
/// exactly once.
#[derive(Debug, Clone)]
pub struct AllocationSet {
    pub(crate) id: u64,
    pub(crate) holder: String,
    pub(crate) allocations: Vec<ResourceAllocation>,
    pub(crate) released: Arc<AtomicBool>,
}

impl AllocationSet {
    pub(crate) fn new(id: u64, holder: String, allocations: Vec<ResourceAllocation>) -> Self {
        Self {
            id,
            holder,
            allocations,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn allocations(&self) -> &[ResourceAllocation] {
        &self.allocations
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Marks the set released; returns true only for the first caller.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }
}

/// Usage of a single named pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub name: String,
    /// `None` means the pool only tracks usage
    pub capacity: Option<u64>,
    pub in_use: u64,
    /// Holder of the exclusive lock, if any
    pub locked_by: Option<String>,
}

impl PoolUsage {
    /// Fraction of capacity in use; exclusive locks count as full.
    pub fn utilization(&self) -> Option<f64> {
        if self.locked_by.is_some() {
            return Some(1.0);
        }
        match self.capacity {
            Some(0) => Some(1.0),
            Some(capacity) => Some(self.in_use as f64 / capacity as f64),
            None => None,
        }
    }
}

/// Point-in-time view of the resource manager.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UtilizationSnapshot {
    pub pools: Vec<PoolUsage>,
    /// Allocation sets granted and not yet released
    pub active_leases: usize,
    pub total_grants: u64,
    pub total_releases: u64,
}

impl UtilizationSnapshot {
    pub fn pool(&self, name: &str) -> Option<&PoolUsage> {
        self.pools.iter().find(|p| p.name == name)
    }
}

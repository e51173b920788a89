//! Resource Manager
//!
//! Single arbiter of shared and exclusive resources. Named pools may carry
//! a numeric capacity (`browser: 4`) or only track usage; any pool can be
//! locked exclusively (`repo:/srv/app`).
//!
//! Acquisition is deadlock-free: the requirements of one call are merged
//! by name and acquired one at a time in lexicographic order, so two
//! holders can never wait on each other in a cycle. A partially acquired
//! request is rolled back when the bounded wait expires.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, trace, warn};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::error::{EngineError, Result};
use crate::util::{lock, millis};
use crate::workflow::ResourceRequirement;

use super::allocation::{AllocationSet, PoolUsage, ResourceAllocation, UtilizationSnapshot};

#[derive(Debug, Default)]
struct Pool {
    capacity: Option<u64>,
    in_use: u64,
    locked_by: Option<String>,
}

impl Pool {
    fn with_capacity(capacity: Option<u64>) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Whether the requirement can ever be satisfied by this pool.
    fn satisfiable(&self, req: &ResourceRequirement) -> bool {
        req.exclusive || self.capacity.map_or(true, |capacity| req.amount <= capacity)
    }

    fn can_grant(&self, req: &ResourceRequirement) -> bool {
        if self.locked_by.is_some() {
            return false;
        }
        if req.exclusive {
            return self.in_use == 0;
        }
        self.capacity
            .map_or(true, |capacity| self.in_use + req.amount <= capacity)
    }

    fn grant(&mut self, req: &ResourceRequirement, holder: &str) {
        if req.exclusive {
            self.locked_by = Some(holder.to_string());
        } else {
            self.in_use += req.amount;
        }
    }

    fn release(&mut self, allocation: &ResourceAllocation) {
        if allocation.exclusive {
            self.locked_by = None;
        } else {
            self.in_use = self.in_use.saturating_sub(allocation.amount);
        }
    }
}

#[derive(Debug, Default)]
struct State {
    pools: BTreeMap<String, Pool>,
    active: BTreeMap<u64, String>,
    next_set_id: u64,
    total_grants: u64,
    total_releases: u64,
}

impl State {
    fn pool_mut(&mut self, name: &str) -> &mut Pool {
        self.pools
            .entry(name.to_string())
            .or_insert_with(|| Pool::with_capacity(None))
    }

    fn try_grant(&mut self, req: &ResourceRequirement, holder: &str) -> Option<ResourceAllocation> {
        let pool = self.pool_mut(&req.name);
        if !pool.can_grant(req) {
            return None;
        }
        pool.grant(req, holder);
        Some(ResourceAllocation {
            resource: req.name.clone(),
            amount: if req.exclusive { 1 } else { req.amount },
            exclusive: req.exclusive,
            holder: holder.to_string(),
            acquired_at: Utc::now(),
        })
    }

    fn give_back(&mut self, allocations: &[ResourceAllocation]) {
        for allocation in allocations {
            if let Some(pool) = self.pools.get_mut(&allocation.resource) {
                pool.release(allocation);
            }
        }
    }

    fn register_set(&mut self, holder: &str, allocations: Vec<ResourceAllocation>) -> AllocationSet {
        self.next_set_id += 1;
        self.total_grants += 1;
        self.active.insert(self.next_set_id, holder.to_string());
        AllocationSet::new(self.next_set_id, holder.to_string(), allocations)
    }
}

struct Inner {
    state: Mutex<State>,
    released: Notify,
}

/// Tracks named resource pools and grants leases on them.
///
/// Cheap to clone; clones share the same pools.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    /// Creates a manager without any configured pools.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                released: Notify::new(),
            }),
        }
    }

    /// Builder-style pool definition.
    pub fn with_pool(self, name: impl Into<String>, capacity: u64) -> Self {
        self.define_pool(name, Some(capacity));
        self
    }

    /// Defines (or redefines the capacity of) a named pool.
    ///
    /// Leases already granted are kept even if they exceed a reduced capacity.
    pub fn define_pool(&self, name: impl Into<String>, capacity: Option<u64>) {
        let name = name.into();
        let mut state = lock(&self.inner.state);
        state.pool_mut(&name).capacity = capacity;
        debug!("Resource pool '{}' capacity: {:?}", name, capacity);
        drop(state);
        self.inner.released.notify_waiters();
    }

    /// Grants every requirement at once or nothing, without waiting.
    ///
    /// Returns `Ok(None)` when the resources are busy and an error when a
    /// requirement can never be satisfied.
    pub fn try_acquire(
        &self,
        requirements: &[ResourceRequirement],
        holder: &str,
    ) -> Result<Option<AllocationGuard>> {
        let ordered = normalize(requirements);
        let mut state = lock(&self.inner.state);

        for req in &ordered {
            let pool = state.pool_mut(&req.name);
            if !pool.satisfiable(req) {
                return Err(unsatisfiable(req, Duration::ZERO));
            }
            if !pool.can_grant(req) {
                return Ok(None);
            }
        }

        let mut granted = Vec::with_capacity(ordered.len());
        for req in &ordered {
            if let Some(allocation) = state.try_grant(req, holder) {
                granted.push(allocation);
            }
        }
        let set = state.register_set(holder, granted);
        drop(state);

        trace!("Granted lease {} to '{}'", set.id(), holder);
        Ok(Some(AllocationGuard::new(self.clone(), set)))
    }

    /// Acquires every requirement, waiting at most `wait` in total.
    ///
    /// Requirements are acquired in lexicographic order of resource name.
    /// On timeout everything acquired so far is released and
    /// `ResourceUnavailable` names the resource that could not be granted.
    pub async fn acquire(
        &self,
        requirements: &[ResourceRequirement],
        holder: &str,
        wait: Duration,
    ) -> Result<AllocationGuard> {
        let ordered = normalize(requirements);
        let started = Instant::now();
        let deadline = started + wait;
        let mut granted: Vec<ResourceAllocation> = Vec::with_capacity(ordered.len());

        for req in &ordered {
            match self.acquire_one(req, holder, deadline).await {
                Ok(allocation) => granted.push(allocation),
                Err(err) => {
                    if !granted.is_empty() {
                        lock(&self.inner.state).give_back(&granted);
                        self.inner.released.notify_waiters();
                    }
                    warn!(
                        "Lease for '{}' not granted after {} ms: {}",
                        holder,
                        millis(started.elapsed()),
                        err
                    );
                    return Err(err);
                }
            }
        }

        let set = lock(&self.inner.state).register_set(holder, granted);
        trace!("Granted lease {} to '{}'", set.id(), holder);
        Ok(AllocationGuard::new(self.clone(), set))
    }

    async fn acquire_one(
        &self,
        req: &ResourceRequirement,
        holder: &str,
        deadline: Instant,
    ) -> Result<ResourceAllocation> {
        let started = Instant::now();
        loop {
            // Register interest before checking so a release in between is not missed
            let released = self.inner.released.notified();
            {
                let mut state = lock(&self.inner.state);
                if !state.pool_mut(&req.name).satisfiable(req) {
                    return Err(unsatisfiable(req, Duration::ZERO));
                }
                if let Some(allocation) = state.try_grant(req, holder) {
                    return Ok(allocation);
                }
            }

            debug!("'{}' waiting for resource '{}'", holder, req.name);
            if timeout_at(deadline, released).await.is_err() {
                return Err(EngineError::ResourceUnavailable {
                    resource: req.name.clone(),
                    waited_ms: millis(started.elapsed()),
                });
            }
        }
    }

    /// Releases an allocation set. Safe to call any number of times; only
    /// the first call returns capacity to the pools.
    pub fn release(&self, set: &AllocationSet) -> bool {
        if !set.mark_released() {
            return false;
        }

        let mut state = lock(&self.inner.state);
        state.give_back(&set.allocations);
        state.active.remove(&set.id);
        state.total_releases += 1;
        drop(state);

        trace!("Released lease {} held by '{}'", set.id, set.holder);
        self.inner.released.notify_waiters();
        true
    }

    /// Current usage of every known pool.
    pub fn utilization(&self) -> UtilizationSnapshot {
        let state = lock(&self.inner.state);
        UtilizationSnapshot {
            pools: state
                .pools
                .iter()
                .map(|(name, pool)| PoolUsage {
                    name: name.clone(),
                    capacity: pool.capacity,
                    in_use: pool.in_use,
                    locked_by: pool.locked_by.clone(),
                })
                .collect(),
            active_leases: state.active.len(),
            total_grants: state.total_grants,
            total_releases: state.total_releases,
        }
    }

    /// Ids of holders with at least one active lease.
    pub fn active_holders(&self) -> Vec<String> {
        let state = lock(&self.inner.state);
        let mut holders: Vec<String> = state.active.values().cloned().collect();
        holders.sort();
        holders.dedup();
        holders
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges duplicate names and sorts requirements into the global order.
fn normalize(requirements: &[ResourceRequirement]) -> Vec<ResourceRequirement> {
    let mut merged: BTreeMap<&str, ResourceRequirement> = BTreeMap::new();
    for req in requirements {
        merged
            .entry(req.name.as_str())
            .and_modify(|existing| {
                existing.exclusive |= req.exclusive;
                existing.amount = existing.amount.max(req.amount);
            })
            .or_insert_with(|| req.clone());
    }
    merged.into_values().collect()
}

fn unsatisfiable(req: &ResourceRequirement, waited: Duration) -> EngineError {
    EngineError::ResourceUnavailable {
        resource: format!("{} (requested {} exceeds capacity)", req.name, req.amount),
        waited_ms: millis(waited),
    }
}

/// A granted lease that is released when dropped.
///
/// Holding the guard across a step guarantees release on every exit path,
/// including errors, timeouts and panics.
pub struct AllocationGuard {
    manager: ResourceManager,
    set: AllocationSet,
}

impl AllocationGuard {
    fn new(manager: ResourceManager, set: AllocationSet) -> Self {
        Self { manager, set }
    }

    pub fn set(&self) -> &AllocationSet {
        &self.set
    }

    /// Releases the lease now instead of on drop.
    pub fn release(self) -> bool {
        self.manager.release(&self.set)
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.manager.release(&self.set);
    }
}

impl std::fmt::Debug for AllocationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationGuard").field("set", &self.set).finish()
    }
}

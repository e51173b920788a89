//! Execution Cache
//!
//! Memoizes step results keyed by [`Fingerprint`]. Entries are replaced
//! whole, never patched. Expiry is lazy: an entry past its TTL is dropped
//! the next time it is looked up, and [`ExecutionCache::sweep`] clears the
//! rest in bulk. An expired entry is never served.
//!
//! Storage is in-memory and bounded by `max_entries`; when full, the entry
//! closest to expiry is evicted.

pub mod fingerprint;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, trace};
use serde::Serialize;

use crate::util::lock;
use crate::workflow::StepResult;

pub use fingerprint::Fingerprint;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: StepResult,
    expires_at: Instant,
    hits: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Hit/miss counters of a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evicted: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<Fingerprint, CacheEntry>,
    stats: CacheStats,
}

/// In-memory step result cache.
#[derive(Debug)]
pub struct ExecutionCache {
    state: Mutex<State>,
    max_entries: usize,
}

impl ExecutionCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_entries: max_entries.max(1),
        }
    }

    /// Returns the cached result marked as a cache hit, or `None` on a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<StepResult> {
        let now = Instant::now();
        let mut state = lock(&self.state);

        let expired = match state.entries.get_mut(fingerprint) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hits += 1;
                let mut result = entry.result.clone();
                result.cache_hit = true;
                state.stats.hits += 1;
                trace!("Cache hit {}", fingerprint.short());
                return Some(result);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.remove(fingerprint);
            state.stats.expired += 1;
            debug!("Cache entry {} expired", fingerprint.short());
        }
        state.stats.misses += 1;
        None
    }

    /// Stores a result, replacing any previous entry for the fingerprint.
    pub fn put(&self, fingerprint: Fingerprint, result: StepResult, ttl: Duration) {
        let now = Instant::now();
        let mut state = lock(&self.state);

        if !state.entries.contains_key(&fingerprint) && state.entries.len() >= self.max_entries {
            Self::purge_expired(&mut state, now);
            if state.entries.len() >= self.max_entries {
                Self::evict_one(&mut state);
            }
        }

        trace!("Cache put {} (ttl {:?})", fingerprint.short(), ttl);
        state.entries.insert(
            fingerprint,
            CacheEntry {
                result,
                expires_at: now + ttl,
                hits: 0,
            },
        );
    }

    /// Drops one entry. Returns whether it was present.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let removed = lock(&self.state).entries.remove(fingerprint).is_some();
        if removed {
            debug!("Cache entry {} invalidated", fingerprint.short());
        }
        removed
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        let count = state.entries.len();
        state.entries.clear();
        debug!("Cache cleared ({} entries)", count);
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut state = lock(&self.state);
        Self::purge_expired(&mut state, Instant::now())
    }

    /// Times the entry has been served, if it is present and fresh.
    pub fn hit_count(&self, fingerprint: &Fingerprint) -> Option<u64> {
        let now = Instant::now();
        lock(&self.state)
            .entries
            .get(fingerprint)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.hits)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }

    fn purge_expired(state: &mut State, now: Instant) -> usize {
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - state.entries.len();
        state.stats.expired += removed as u64;
        removed
    }

    fn evict_one(state: &mut State) {
        let victim = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at)
            .map(|(fingerprint, _)| fingerprint.clone());
        if let Some(fingerprint) = victim {
            state.entries.remove(&fingerprint);
            state.stats.evicted += 1;
        }
    }
}

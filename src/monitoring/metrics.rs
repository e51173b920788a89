//! Handler Metrics
//!
//! Per-handler-type counters for resolutions and invocations.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::util::lock;

/// Accumulated statistics of one handler type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HandlerStats {
    pub handler_type: String,
    pub resolutions: u64,
    /// Lookups of the type that found no active registration
    pub resolution_failures: u64,
    pub invocations: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
    pub last_invoked: Option<DateTime<Utc>>,
}

impl HandlerStats {
    fn new(handler_type: &str) -> Self {
        Self {
            handler_type: handler_type.to_string(),
            ..Self::default()
        }
    }

    pub fn avg_duration_ms(&self) -> Option<f64> {
        if self.invocations == 0 {
            None
        } else {
            Some(self.total_duration_ms as f64 / self.invocations as f64)
        }
    }

    pub fn failure_rate(&self) -> Option<f64> {
        if self.invocations == 0 {
            None
        } else {
            Some(self.failures as f64 / self.invocations as f64)
        }
    }
}

/// Thread-safe metrics collector keyed by handler type.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    stats: Mutex<BTreeMap<String, HandlerStats>>,
}

impl HandlerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_resolution(&self, handler_type: &str, found: bool) {
        let mut stats = lock(&self.stats);
        let entry = stats
            .entry(handler_type.to_string())
            .or_insert_with(|| HandlerStats::new(handler_type));
        if found {
            entry.resolutions += 1;
        } else {
            entry.resolution_failures += 1;
        }
    }

    pub fn record_invocation(&self, handler_type: &str, duration_ms: u64, success: bool) {
        let mut stats = lock(&self.stats);
        let entry = stats
            .entry(handler_type.to_string())
            .or_insert_with(|| HandlerStats::new(handler_type));
        entry.invocations += 1;
        if !success {
            entry.failures += 1;
        }
        entry.total_duration_ms = entry.total_duration_ms.saturating_add(duration_ms);
        entry.max_duration_ms = entry.max_duration_ms.max(duration_ms);
        entry.last_invoked = Some(Utc::now());
    }

    pub fn get(&self, handler_type: &str) -> Option<HandlerStats> {
        lock(&self.stats).get(handler_type).cloned()
    }

    /// All statistics, ordered by handler type.
    pub fn snapshot(&self) -> Vec<HandlerStats> {
        lock(&self.stats).values().cloned().collect()
    }

    pub fn reset(&self) {
        lock(&self.stats).clear();
    }
}

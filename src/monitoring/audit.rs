//! Audit Log
//!
//! Bounded in-memory history of handler registry activity. When full, the
//! oldest record is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Register,
    Replace,
    Unregister,
    Migrate,
    Resolve,
    Invoke,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditAction::Register => "register",
            AuditAction::Replace => "replace",
            AuditAction::Unregister => "unregister",
            AuditAction::Migrate => "migrate",
            AuditAction::Resolve => "resolve",
            AuditAction::Invoke => "invoke",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub handler_type: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, handler_type: impl Into<String>, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            handler_type: handler_type.into(),
            success,
            duration_ms: None,
            execution_id: None,
            detail: None,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug)]
pub struct AuditLog {
    records: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn record(&self, record: AuditRecord) {
        let mut records = lock(&self.records);
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Records oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        lock(&self.records).iter().cloned().collect()
    }

    /// Most recent records for one handler type, newest first.
    pub fn for_handler(&self, handler_type: &str, limit: usize) -> Vec<AuditRecord> {
        lock(&self.records)
            .iter()
            .rev()
            .filter(|record| record.handler_type == handler_type)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

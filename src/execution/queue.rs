//! Execution Queue
//!
//! Bounded priority queue of admitted executions: higher priority first,
//! FIFO within a priority. A full queue rejects new entries instead of
//! blocking.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::error::{EngineError, Result};
use crate::workflow::Priority;

type QueueKey = (Reverse<Priority>, u64);

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub execution_id: String,
    pub priority: Priority,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub struct ExecutionQueue {
    entries: BTreeMap<QueueKey, QueueEntry>,
    index: HashMap<String, QueueKey>,
    next_seq: u64,
    capacity: usize,
}

impl ExecutionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            capacity,
        }
    }

    /// Enqueues an execution; fails with `CapacityExceeded` when full.
    pub fn push(&mut self, execution_id: impl Into<String>, priority: Priority) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(EngineError::CapacityExceeded {
                what: "execution queue".to_string(),
                capacity: self.capacity,
            });
        }

        let execution_id = execution_id.into();
        let key = (Reverse(priority), self.next_seq);
        self.next_seq += 1;

        self.index.insert(execution_id.clone(), key);
        self.entries.insert(
            key,
            QueueEntry {
                execution_id,
                priority,
                enqueued_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Removes and returns the next entry in dispatch order.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        let key = *self.entries.keys().next()?;
        let entry = self.entries.remove(&key)?;
        self.index.remove(&entry.execution_id);
        Some(entry)
    }

    pub fn remove(&mut self, execution_id: &str) -> Option<QueueEntry> {
        let key = self.index.remove(execution_id)?;
        self.entries.remove(&key)
    }

    /// Entries in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values()
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.index.contains_key(execution_id)
    }

    /// Zero-based position in dispatch order.
    pub fn position(&self, execution_id: &str) -> Option<usize> {
        let key = self.index.get(execution_id)?;
        Some(self.entries.range(..*key).count())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = ExecutionQueue::new(10);
        queue.push("low", Priority::Low).unwrap();
        queue.push("normal-1", Priority::Normal).unwrap();
        queue.push("critical", Priority::Critical).unwrap();
        queue.push("normal-2", Priority::Normal).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|e| e.execution_id)
            .collect();
        assert_eq!(order, vec!["critical", "normal-1", "normal-2", "low"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_rejects() {
        let mut queue = ExecutionQueue::new(1);
        queue.push("a", Priority::Normal).unwrap();

        let result = queue.push("b", Priority::Critical);
        assert!(matches!(
            result,
            Err(EngineError::CapacityExceeded { capacity: 1, .. })
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_and_position() {
        let mut queue = ExecutionQueue::new(10);
        queue.push("a", Priority::Normal).unwrap();
        queue.push("b", Priority::Normal).unwrap();
        queue.push("c", Priority::High).unwrap();

        assert_eq!(queue.position("c"), Some(0));
        assert_eq!(queue.position("b"), Some(2));

        assert!(queue.remove("a").is_some());
        assert!(queue.remove("a").is_none());
        assert!(!queue.contains("a"));
        assert_eq!(queue.position("b"), Some(1));

        let ids: Vec<&str> = queue.iter().map(|e| e.execution_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }
}

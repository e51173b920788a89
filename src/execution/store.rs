//! Execution Store
//!
//! Retains finished executions for status lookups and queries by workflow
//! id, status and time range.
//!
//! - [`MemoryExecutionStore`]: bounded in-memory history
//! - [`FileExecutionStore`]: one pretty-printed JSON file per execution,
//!   `{directory}/{execution_id}.json`

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::error::Result;
use crate::util::lock;
use crate::workflow::{ExecutionStatus, WorkflowExecution};

/// Filter for [`ExecutionStore::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionQuery {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    /// Inclusive lower bound on submission time
    pub submitted_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on submission time
    pub submitted_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExecutionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn between(mut self, after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.submitted_after = Some(after);
        self.submitted_before = Some(before);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        self.workflow_id
            .as_ref()
            .map_or(true, |id| &execution.workflow_id == id)
            && self.status.map_or(true, |s| execution.status == s)
            && self
                .submitted_after
                .map_or(true, |after| execution.submitted_at >= after)
            && self
                .submitted_before
                .map_or(true, |before| execution.submitted_at < before)
    }

    /// Filters, orders by submission time and applies the limit.
    pub fn apply(&self, executions: impl IntoIterator<Item = WorkflowExecution>) -> Vec<WorkflowExecution> {
        let mut matched: Vec<WorkflowExecution> =
            executions.into_iter().filter(|e| self.matches(e)).collect();
        matched.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Persistence of finished executions.
pub trait ExecutionStore: Send + Sync {
    /// Inserts or replaces the record with the same execution id.
    fn save(&self, execution: &WorkflowExecution) -> Result<()>;

    fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecution>>;

    fn query(&self, query: &ExecutionQuery) -> Result<Vec<WorkflowExecution>>;
}

/// Keeps the most recent `history_limit` executions in memory.
#[derive(Debug)]
pub struct MemoryExecutionStore {
    executions: Mutex<VecDeque<WorkflowExecution>>,
    history_limit: usize,
}

impl MemoryExecutionStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            executions: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.executions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn save(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut executions = lock(&self.executions);
        executions.retain(|e| e.execution_id != execution.execution_id);
        while executions.len() >= self.history_limit {
            executions.pop_front();
        }
        executions.push_back(execution.clone());
        Ok(())
    }

    fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecution>> {
        Ok(lock(&self.executions)
            .iter()
            .find(|e| e.execution_id == execution_id)
            .cloned())
    }

    fn query(&self, query: &ExecutionQuery) -> Result<Vec<WorkflowExecution>> {
        let executions = lock(&self.executions).iter().cloned().collect::<Vec<_>>();
        Ok(query.apply(executions))
    }
}

/// Writes each execution to its own JSON file.
#[derive(Debug)]
pub struct FileExecutionStore {
    directory: PathBuf,
}

impl FileExecutionStore {
    /// Opens (creating if needed) a store directory.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, execution_id: &str) -> PathBuf {
        let safe: String = execution_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.directory.join(format!("{}.json", safe))
    }
}

impl ExecutionStore for FileExecutionStore {
    fn save(&self, execution: &WorkflowExecution) -> Result<()> {
        let path = self.path_for(&execution.execution_id);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(execution)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        debug!("Saved execution record to {}", path.display());
        Ok(())
    }

    fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecution>> {
        let path = self.path_for(execution_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn query(&self, query: &ExecutionQuery) -> Result<Vec<WorkflowExecution>> {
        let mut executions = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(crate::error::EngineError::from)
                .and_then(|content| Ok(serde_json::from_str::<WorkflowExecution>(&content)?));
            match parsed {
                Ok(execution) => executions.push(execution),
                Err(e) => warn!("Skipping unreadable execution record {}: {}", path.display(), e),
            }
        }
        Ok(query.apply(executions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Priority, StepSpec, StrategyKind, WorkflowDefinition};
    use chrono::Duration;
    use tempfile::TempDir;

    fn execution(id: &str, workflow: &str, status: ExecutionStatus) -> WorkflowExecution {
        let definition = WorkflowDefinition::new(workflow).with_step(StepSpec::new("echo"));
        let mut execution =
            WorkflowExecution::new(id, &definition, StrategyKind::Basic, Priority::Normal);
        execution.status = status;
        execution
    }

    #[test]
    fn test_memory_store_is_bounded() {
        let store = MemoryExecutionStore::new(2);
        for id in ["a", "b", "c"] {
            store
                .save(&execution(id, "wf", ExecutionStatus::Completed))
                .unwrap();
        }
        assert_eq!(store.len(), 2);
        assert!(store.get("a").unwrap().is_none());
        assert!(store.get("c").unwrap().is_some());
    }

    #[test]
    fn test_memory_store_replaces_same_id() {
        let store = MemoryExecutionStore::new(10);
        store.save(&execution("a", "wf", ExecutionStatus::Running)).unwrap();
        store.save(&execution("a", "wf", ExecutionStatus::Failed)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().unwrap().status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_query_filters() {
        let store = MemoryExecutionStore::new(10);
        store.save(&execution("a", "deploy", ExecutionStatus::Completed)).unwrap();
        store.save(&execution("b", "deploy", ExecutionStatus::Failed)).unwrap();
        store.save(&execution("c", "build", ExecutionStatus::Completed)).unwrap();

        let deploys = store.query(&ExecutionQuery::new().workflow("deploy")).unwrap();
        assert_eq!(deploys.len(), 2);

        let completed = store
            .query(&ExecutionQuery::new().status(ExecutionStatus::Completed))
            .unwrap();
        assert_eq!(completed.len(), 2);

        let now = Utc::now();
        let recent = store
            .query(&ExecutionQuery::new().between(now - Duration::hours(1), now + Duration::hours(1)))
            .unwrap();
        assert_eq!(recent.len(), 3);
        let future = store
            .query(&ExecutionQuery::new().between(now + Duration::hours(1), now + Duration::hours(2)))
            .unwrap();
        assert!(future.is_empty());

        assert_eq!(store.query(&ExecutionQuery::new().limit(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileExecutionStore::open(dir.path().join("executions")).unwrap();

        store.save(&execution("exec-1", "deploy", ExecutionStatus::Completed)).unwrap();
        store.save(&execution("exec-2", "build", ExecutionStatus::Failed)).unwrap();
        fs::write(store.directory().join("garbage.json"), "not json").unwrap();

        let loaded = store.get("exec-1").unwrap().unwrap();
        assert_eq!(loaded.workflow_id, "deploy");
        assert!(store.get("missing").unwrap().is_none());

        let failed = store
            .query(&ExecutionQuery::new().status(ExecutionStatus::Failed))
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].execution_id, "exec-2");
    }
}

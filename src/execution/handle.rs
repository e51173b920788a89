//! Shared execution state
//!
//! An [`ExecutionHandle`] is the live record of one execution, shared by
//! the scheduler (status, cancel) and the engine (progress). Status
//! changes are published on a watch channel so callers can wait for a
//! terminal state without polling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::Result;
use crate::util::lock;
use crate::workflow::{ExecutionStatus, StepResult, WorkflowDefinition, WorkflowExecution};

use super::cancel::CancellationToken;

/// Result of asking a live execution to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    /// Still queued; the caller must remove it from the queue
    Queued,
    /// Running; it stops at the next step boundary
    Cancelling,
    AlreadyFinished,
}

pub struct ExecutionHandle {
    execution_id: String,
    definition: Arc<WorkflowDefinition>,
    state: Mutex<WorkflowExecution>,
    status: watch::Sender<ExecutionStatus>,
    cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn new(execution: WorkflowExecution, definition: Arc<WorkflowDefinition>) -> Self {
        let (status, _) = watch::channel(execution.status);
        Self {
            execution_id: execution.execution_id.clone(),
            definition,
            state: Mutex::new(execution),
            status,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.execution_id
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn status(&self) -> ExecutionStatus {
        lock(&self.state).status
    }

    /// Copy of the current execution record.
    pub fn snapshot(&self) -> WorkflowExecution {
        lock(&self.state).clone()
    }

    pub fn transition(&self, next: ExecutionStatus) -> Result<()> {
        let mut state = lock(&self.state);
        state.transition(next)?;
        self.status.send_replace(next);
        Ok(())
    }

    pub fn record_step(&self, result: StepResult) -> Result<()> {
        lock(&self.state).record_step(result)
    }

    /// Runs `f` with exclusive access to the execution record.
    ///
    /// Status must be changed through [`ExecutionHandle::transition`].
    pub fn update<R>(&self, f: impl FnOnce(&mut WorkflowExecution) -> R) -> R {
        f(&mut lock(&self.state))
    }

    /// Ends a run that stopped without a critical failure.
    ///
    /// A cancel flagged at any point before this call wins over completion.
    pub fn settle(&self) -> Result<ExecutionStatus> {
        let mut state = lock(&self.state);
        let next = if state.status == ExecutionStatus::Cancelling || self.cancel.is_cancelled() {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Completed
        };
        state.transition(next)?;
        self.status.send_replace(next);
        Ok(next)
    }

    /// Flags the execution for cancellation, atomically with its status.
    pub fn request_cancel(&self) -> Result<CancelRequest> {
        let mut state = lock(&self.state);
        let request = match state.status {
            ExecutionStatus::Queued => CancelRequest::Queued,
            ExecutionStatus::Running => {
                state.transition(ExecutionStatus::Cancelling)?;
                self.status.send_replace(ExecutionStatus::Cancelling);
                CancelRequest::Cancelling
            }
            ExecutionStatus::Cancelling => CancelRequest::Cancelling,
            _ => return Ok(CancelRequest::AlreadyFinished),
        };
        self.cancel.cancel();
        Ok(request)
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.status.subscribe()
    }

    /// Waits up to `timeout` for a terminal status.
    ///
    /// Returns the terminal status, or `None` on timeout.
    pub async fn wait_terminal(&self, timeout: Duration) -> Option<ExecutionStatus> {
        let mut status = self.subscribe();
        let terminal = async move {
            loop {
                let current = *status.borrow_and_update();
                if current.is_terminal() {
                    return current;
                }
                if status.changed().await.is_err() {
                    return current;
                }
            }
        };
        tokio::time::timeout(timeout, terminal).await.ok()
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("execution_id", &self.execution_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Priority, StepSpec, StrategyKind};

    fn handle() -> Arc<ExecutionHandle> {
        let definition = WorkflowDefinition::new("wf").with_step(StepSpec::new("echo"));
        let execution = WorkflowExecution::new(
            "exec-1",
            &definition,
            StrategyKind::Basic,
            Priority::Normal,
        );
        Arc::new(ExecutionHandle::new(execution, Arc::new(definition)))
    }

    #[test]
    fn test_transition_updates_status() {
        let handle = handle();
        let receiver = handle.subscribe();
        handle.transition(ExecutionStatus::Running).unwrap();

        assert_eq!(handle.status(), ExecutionStatus::Running);
        assert_eq!(*receiver.borrow(), ExecutionStatus::Running);
        assert!(handle.transition(ExecutionStatus::Queued).is_err());
    }

    #[test]
    fn test_request_cancel_by_status() {
        let handle = handle();
        assert_eq!(handle.request_cancel().unwrap(), CancelRequest::Queued);
        assert!(handle.cancel_token().is_cancelled());

        handle.transition(ExecutionStatus::Running).unwrap();
        assert_eq!(handle.request_cancel().unwrap(), CancelRequest::Cancelling);
        assert_eq!(handle.status(), ExecutionStatus::Cancelling);

        handle.transition(ExecutionStatus::Cancelled).unwrap();
        assert_eq!(handle.request_cancel().unwrap(), CancelRequest::AlreadyFinished);
    }

    #[test]
    fn test_settle_prefers_cancel_over_completion() {
        let plain = handle();
        plain.transition(ExecutionStatus::Running).unwrap();
        assert_eq!(plain.settle().unwrap(), ExecutionStatus::Completed);

        let cancelled = handle();
        cancelled.transition(ExecutionStatus::Running).unwrap();
        cancelled.request_cancel().unwrap();
        assert_eq!(cancelled.settle().unwrap(), ExecutionStatus::Cancelled);
        assert_eq!(cancelled.status(), ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_terminal() {
        let handle = handle();
        assert_eq!(handle.wait_terminal(Duration::from_millis(20)).await, None);

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.wait_terminal(Duration::from_secs(2)).await })
        };
        handle.transition(ExecutionStatus::Running).unwrap();
        handle.transition(ExecutionStatus::Completed).unwrap();

        assert_eq!(waiter.await.unwrap(), Some(ExecutionStatus::Completed));
        assert!(handle.snapshot().finished_at.is_some());
    }
}

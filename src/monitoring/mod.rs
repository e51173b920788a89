//! Monitoring Module
//!
//! Observability for executions and handlers.
//!
//! # Components
//!
//! - [`events`]: lifecycle events and the [`EventSink`] seam
//! - [`timeline`]: step start/end timing for Gantt charts
//! - [`metrics`] / [`audit`]: per-handler counters and bounded audit history
//! - [`advisor`]: advisory recommendations from handler metrics
//! - [`estimator`]: rolling duration and failure estimates per handler
//! - [`host`]: CPU and memory sampling of the current process

pub mod advisor;
pub mod audit;
pub mod estimator;
pub mod events;
pub mod host;
pub mod metrics;
pub mod timeline;

use log::trace;

pub use advisor::{HandlerAdvisor, Recommendation, RecommendationKind};
pub use audit::{AuditAction, AuditLog, AuditRecord};
pub use estimator::{ExecutionMonitor, HandlerEstimate};
pub use events::{EventSink, ExecutionEvent, LogSink, MemorySink};
pub use host::{HostMonitor, HostSample, HostSampler};
pub use metrics::{HandlerMetrics, HandlerStats};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};

/// Handler metrics plus audit history, fed by the handler registry.
#[derive(Debug)]
pub struct HandlerTelemetry {
    metrics: HandlerMetrics,
    audit: AuditLog,
}

impl HandlerTelemetry {
    pub fn new(audit_capacity: usize) -> Self {
        Self {
            metrics: HandlerMetrics::new(),
            audit: AuditLog::new(audit_capacity),
        }
    }

    pub fn metrics(&self) -> &HandlerMetrics {
        &self.metrics
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn record_resolution(&self, handler_type: &str, found: bool) {
        trace!("resolve handler={} found={}", handler_type, found);
        self.metrics.record_resolution(handler_type, found);
        self.audit
            .record(AuditRecord::new(AuditAction::Resolve, handler_type, found));
    }

    /// `failure` carries the error message of a failed invocation.
    pub fn record_invocation(
        &self,
        handler_type: &str,
        execution_id: &str,
        duration_ms: u64,
        failure: Option<String>,
    ) {
        let success = failure.is_none();
        trace!(
            "invoke handler={} execution={} duration_ms={} success={}",
            handler_type,
            execution_id,
            duration_ms,
            success
        );
        self.metrics
            .record_invocation(handler_type, duration_ms, success);

        let mut record = AuditRecord::new(AuditAction::Invoke, handler_type, success)
            .with_duration_ms(duration_ms);
        if !execution_id.is_empty() {
            record = record.with_execution(execution_id);
        }
        if let Some(message) = failure {
            record = record.with_detail(message);
        }
        self.audit.record(record);
    }

    pub fn record_registry_change(
        &self,
        action: AuditAction,
        handler_type: &str,
        success: bool,
        detail: Option<&str>,
    ) {
        let mut record = AuditRecord::new(action, handler_type, success);
        if let Some(detail) = detail {
            record = record.with_detail(detail);
        }
        self.audit.record(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_records_metrics_and_audit() {
        let telemetry = HandlerTelemetry::new(10);
        telemetry.record_resolution("echo", true);
        telemetry.record_invocation("echo", "exec-1", 12, Some("boom".to_string()));
        telemetry.record_registry_change(AuditAction::Register, "echo", true, None);

        let stats = telemetry.metrics().get("echo").unwrap();
        assert_eq!(stats.resolutions, 1);
        assert_eq!(stats.failures, 1);

        let records = telemetry.audit().records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].detail.as_deref(), Some("boom"));
        assert_eq!(records[1].execution_id.as_deref(), Some("exec-1"));
    }
}

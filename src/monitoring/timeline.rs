//! Execution Timeline
//!
//! Records when each step starts and finishes, as an [`EventSink`], and
//! renders the result as an ASCII Gantt chart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::util::lock;

use super::events::{EventSink, ExecutionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_key: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Step timing of one execution (or of every execution when unfiltered).
#[derive(Debug)]
pub struct ExecutionTimeline {
    events: Mutex<Vec<TimelineEvent>>,
    start_time: Instant,
    execution_id: Option<String>,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            start_time: Instant::now(),
            execution_id: None,
        }
    }

    /// Only records events of the given execution.
    pub fn for_execution(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: Some(execution_id.into()),
            ..Self::new()
        }
    }

    pub fn add_event(&self, step_key: impl Into<String>, event_type: EventType) {
        lock(&self.events).push(TimelineEvent {
            step_key: step_key.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> Vec<TimelineEvent> {
        lock(&self.events).clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// (start, end) offsets in milliseconds of every finished step,
    /// ordered by start.
    fn spans(&self) -> Vec<(String, u128, u128)> {
        let mut open: HashMap<String, u128> = HashMap::new();
        let mut spans = Vec::new();

        for event in lock(&self.events).iter() {
            let offset = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    open.insert(event.step_key.clone(), offset);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = open.remove(&event.step_key) {
                        spans.push((event.step_key.clone(), start, offset));
                    }
                }
            }
        }

        spans.sort_by_key(|(_, start, _)| *start);
        spans
    }

    /// Step durations in milliseconds.
    pub fn durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|(key, start, end)| (key, end - start))
            .collect()
    }

    /// Renders one bar per finished step, scaled to 50 columns.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }
        let scale = 50.0 / total_time as f64;

        for (step_key, start, end) in self.spans() {
            let start_pos = (start as f64 * scale) as usize;
            let width = (((end - start) as f64 * scale).max(1.0)) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{} |{:<50}| ({} ms)\n",
                truncate(&step_key, 12),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for ExecutionTimeline {
    fn emit(&self, event: &ExecutionEvent) {
        if let Some(wanted) = &self.execution_id {
            if event.execution_id() != wanted {
                return;
            }
        }

        match event {
            ExecutionEvent::StepStarted { step_key, .. } => {
                self.add_event(step_key.clone(), EventType::Started)
            }
            ExecutionEvent::StepCompleted {
                step_key, success, ..
            } => {
                let event_type = if *success {
                    EventType::Completed
                } else {
                    EventType::Failed
                };
                self.add_event(step_key.clone(), event_type)
            }
            _ => {}
        }
    }
}

/// Pads or truncates to exactly `width` characters.
fn truncate(s: &str, width: usize) -> String {
    let count = s.chars().count();
    if count <= width {
        format!("{:width$}", s, width = width)
    } else {
        let head: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

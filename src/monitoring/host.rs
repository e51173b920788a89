//! Host Resource Sampling
//!
//! Tracks CPU and memory usage of the current process while executions
//! run, for the end-of-run report.

use std::time::{Duration, Instant};

use log::warn;
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct HostSample {
    pub timestamp: Instant,
    /// CPU usage percentage (0-100+)
    pub cpu_usage: f32,
    pub memory_mb: u64,
}

/// Samples the current process with `sysinfo`.
pub struct HostMonitor {
    system: System,
    process_id: Option<Pid>,
    samples: Vec<HostSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl HostMonitor {
    pub fn new() -> Self {
        let process_id = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Host sampling disabled: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            process_id,
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a sample.
    ///
    /// The first call only primes CPU accounting; later calls are rate
    /// limited by `min_interval`.
    pub fn sample(&mut self) {
        let Some(pid) = self.process_id else {
            return;
        };
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        if let Some(process) = self.system.process(pid) {
            self.samples.push(HostSample {
                timestamp: now,
                cpu_usage: process.cpu_usage(),
                memory_mb: process.memory() / (1024 * 1024),
            });
        }
    }

    pub fn samples(&self) -> &[HostSample] {
        &self.samples
    }

    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }

    pub fn summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }
        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {} MB\n  Samples: {}",
            self.average_cpu(),
            self.peak_memory_mb(),
            self.samples.len()
        )
    }
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task sampling the host until stopped.
pub struct HostSampler {
    stop: oneshot::Sender<()>,
    task: JoinHandle<HostMonitor>,
}

impl HostSampler {
    pub fn spawn(interval: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut monitor = HostMonitor::new().with_min_interval(interval);
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => monitor.sample(),
                }
            }
            monitor
        });
        Self { stop, task }
    }

    /// Stops sampling and returns the collected samples.
    pub async fn finish(self) -> HostMonitor {
        let _ = self.stop.send(());
        match self.task.await {
            Ok(monitor) => monitor,
            Err(e) => {
                warn!("Host sampler stopped abnormally: {}", e);
                HostMonitor::new()
            }
        }
    }
}

//! Engine Configuration
//!
//! Every field has a default, so an empty (or missing) file is a valid
//! configuration.
//!
//! # Config File Resolution Priority
//!
//! 1. `SEQFLOW_CONFIG` environment variable
//! 2. `seqflow.yaml` next to the executable
//! 3. `seqflow.yaml` in the current working directory
//!
//! ```yaml
//! scheduler:
//!   queue_capacity: 128
//!   max_concurrent: 2
//!   priority_limits:
//!     low: 1
//! engine:
//!   default_strategy: smart
//!   step_timeout_ms: 60000
//! resources:
//!   pools:
//!     browser: 4
//! store:
//!   kind: file
//!   directory: .seqflow/executions
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::workflow::{Priority, StrategyKind};

pub const CONFIG_ENV_VAR: &str = "SEQFLOW_CONFIG";
pub const CONFIG_FILE_NAME: &str = "seqflow.yaml";

/// Lazily-resolved path of the configuration file.
pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    // Priority 1: explicit override
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            info!("Using config from {}: {}", CONFIG_ENV_VAR, path);
            return PathBuf::from(path);
        }
    }

    // Priority 2: next to the executable
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let prod_path = exe_dir.join(CONFIG_FILE_NAME);
            if prod_path.exists() {
                info!("Using config next to executable: {}", prod_path.display());
                return prod_path;
            }
        }
    }

    // Priority 3: current working directory
    PathBuf::from(CONFIG_FILE_NAME)
});

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of queued (not yet running) executions
    pub queue_capacity: usize,
    /// Maximum number of executions running at once
    pub max_concurrent: u64,
    /// Optional per-priority caps on running executions
    pub priority_limits: BTreeMap<Priority, u64>,
    /// Fallback interval of the dispatch loop
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_concurrent: 4,
            priority_limits: BTreeMap::new(),
            poll_interval_ms: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SmartConfig {
    /// Failure rate at which a handler's steps are flagged
    pub failure_threshold: f64,
    /// Observations needed before flagging
    pub min_samples: u64,
    /// Groups expected to finish within this many ms acquire their
    /// resources once, up front
    pub preacquire_max_group_ms: u64,
    /// Record flagged steps as failed instead of dispatching them
    pub skip_predicted_failures: bool,
    /// Weight of the newest observation in duration/failure estimates
    pub smoothing: f64,
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            min_samples: 3,
            preacquire_max_group_ms: 2_000,
            skip_predicted_failures: false,
            smoothing: 0.3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Strategy used when a workflow does not name one
    pub default_strategy: StrategyKind,
    /// Handler timeout for steps without their own
    pub step_timeout_ms: u64,
    /// Longest a step waits for its resources
    pub resource_wait_ms: u64,
    /// Largest number of steps merged into one batched dispatch
    pub max_batch_size: usize,
    pub smart: SmartConfig,
}

impl EngineSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn resource_wait(&self) -> Duration {
        Duration::from_millis(self.resource_wait_ms)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::Optimized,
            step_timeout_ms: 30_000,
            resource_wait_ms: 10_000,
            max_batch_size: 8,
            smart: SmartConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Capacity of each named pool
    pub pools: BTreeMap<String, u64>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        let mut pools = BTreeMap::new();
        pools.insert("cpu".to_string(), num_cpus::get() as u64);
        Self { pools }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Records kept by the handler audit log
    pub audit_capacity: usize,
    /// Forward execution events to the log
    pub log_events: bool,
    pub slow_handler_ms: f64,
    pub faulty_handler_rate: f64,
    pub advisor_min_invocations: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            audit_capacity: 1000,
            log_events: true,
            slow_handler_ms: 5_000.0,
            faulty_handler_rate: 0.25,
            advisor_min_invocations: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Finished executions kept by the memory store
    pub history_limit: usize,
    /// Directory of the file store
    pub directory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            history_limit: 1000,
            directory: PathBuf::from(".seqflow").join("executions"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub engine: EngineSettings,
    pub resources: ResourcesConfig,
    pub cache: CacheConfig,
    pub telemetry: TelemetryConfig,
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Loads and validates a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads the file at [`CONFIG_PATH`], or defaults when it does not exist.
    pub fn discover() -> Result<Self> {
        let path: &Path = &CONFIG_PATH;
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Rejects zero capacities and timeouts.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.scheduler.queue_capacity == 0 {
            problems.push("scheduler.queue_capacity must be greater than 0".to_string());
        }
        if self.scheduler.max_concurrent == 0 {
            problems.push("scheduler.max_concurrent must be greater than 0".to_string());
        }
        if self.scheduler.poll_interval_ms == 0 {
            problems.push("scheduler.poll_interval_ms must be greater than 0".to_string());
        }
        for (priority, limit) in &self.scheduler.priority_limits {
            if *limit == 0 {
                problems.push(format!("scheduler.priority_limits.{} must be greater than 0", priority));
            }
        }
        if self.engine.step_timeout_ms == 0 {
            problems.push("engine.step_timeout_ms must be greater than 0".to_string());
        }
        if self.engine.resource_wait_ms == 0 {
            problems.push("engine.resource_wait_ms must be greater than 0".to_string());
        }
        if self.engine.max_batch_size == 0 {
            problems.push("engine.max_batch_size must be greater than 0".to_string());
        }
        let smart = &self.engine.smart;
        if !(0.0..=1.0).contains(&smart.failure_threshold) {
            problems.push("engine.smart.failure_threshold must be within 0..=1".to_string());
        }
        if !(smart.smoothing > 0.0 && smart.smoothing <= 1.0) {
            problems.push("engine.smart.smoothing must be within (0, 1]".to_string());
        }
        for (name, capacity) in &self.resources.pools {
            if *capacity == 0 {
                problems.push(format!("resources.pools.{} must be greater than 0", name));
            }
        }
        if self.cache.ttl_secs == 0 {
            problems.push("cache.ttl_secs must be greater than 0".to_string());
        }
        if self.cache.max_entries == 0 {
            problems.push("cache.max_entries must be greater than 0".to_string());
        }
        if self.telemetry.audit_capacity == 0 {
            problems.push("telemetry.audit_capacity must be greater than 0".to_string());
        }
        if self.store.history_limit == 0 {
            problems.push("store.history_limit must be greater than 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Config(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler.queue_capacity, 256);
        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(config.engine.default_strategy, StrategyKind::Optimized);
        assert_eq!(config.engine.step_timeout(), Duration::from_secs(30));
        assert_eq!(config.engine.resource_wait(), Duration::from_secs(10));
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.max_entries, 1024);
        assert_eq!(config.telemetry.audit_capacity, 1000);
        assert_eq!(config.resources.pools["cpu"], num_cpus::get() as u64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(EngineConfig::from_yaml("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml(
            r#"
scheduler:
  max_concurrent: 2
  priority_limits:
    low: 1
engine:
  default_strategy: smart
  smart:
    skip_predicted_failures: true
store:
  kind: file
"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_concurrent, 2);
        assert_eq!(config.scheduler.queue_capacity, 256);
        assert_eq!(config.scheduler.priority_limits[&Priority::Low], 1);
        assert_eq!(config.engine.default_strategy, StrategyKind::Smart);
        assert!(config.engine.smart.skip_predicted_failures);
        assert_eq!(config.engine.smart.min_samples, 3);
        assert_eq!(config.store.kind, StoreKind::File);
    }

    #[test]
    fn test_validate_rejects_zeros() {
        let mut config = EngineConfig::default();
        config.scheduler.queue_capacity = 0;
        config.cache.ttl_secs = 0;

        match config.validate() {
            Err(EngineError::Config(message)) => {
                assert!(message.contains("queue_capacity"));
                assert!(message.contains("ttl_secs"));
            }
            other => panic!("Expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "cache:\n  enabled: false").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "scheduler: [unclosed").unwrap();
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(EngineError::Yaml(_))
        ));
    }
}

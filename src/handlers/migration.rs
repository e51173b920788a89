//! Legacy handler migration
//!
//! Moves handlers found in an external, pre-existing registry into a
//! [`HandlerRegistry`], wrapping each in the adapter its shape needs.
//!
//! Every handler is migrated independently: one bad entry is reported as
//! failed and the rest continue. Re-running against the same source is
//! safe; entries already migrated at the same version are skipped, and
//! natively registered types are never overwritten.

use log::{info, warn};
use serde::Serialize;

use crate::error::EngineError;

use super::registry::{HandlerRegistration, HandlerRegistry, InstallOutcome};

/// One entry of an external handler source.
///
/// `Err` carries the reason an entry could not be read from the source.
pub type LegacyEntry = std::result::Result<HandlerRegistration, LegacyEntryError>;

/// An entry the source could not turn into a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyEntryError {
    pub handler_type: String,
    pub reason: String,
}

impl LegacyEntryError {
    pub fn new(handler_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            handler_type: handler_type.into(),
            reason: reason.into(),
        }
    }
}

/// A pre-existing registry of handlers in one of the older shapes.
pub trait LegacyHandlerSource {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    fn entries(&self) -> Vec<LegacyEntry>;
}

/// Per-handler result of a migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Migrated { handler_type: String, replaced: bool },
    Skipped { handler_type: String, reason: String },
    Failed { handler_type: String, error: String },
}

impl MigrationOutcome {
    pub fn handler_type(&self) -> &str {
        match self {
            MigrationOutcome::Migrated { handler_type, .. }
            | MigrationOutcome::Skipped { handler_type, .. }
            | MigrationOutcome::Failed { handler_type, .. } => handler_type,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub source: String,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<MigrationOutcome>,
}

impl MigrationReport {
    fn push(&mut self, outcome: MigrationOutcome) {
        match outcome {
            MigrationOutcome::Migrated { .. } => self.migrated += 1,
            MigrationOutcome::Skipped { .. } => self.skipped += 1,
            MigrationOutcome::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failures(&self) -> impl Iterator<Item = &MigrationOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, MigrationOutcome::Failed { .. }))
    }
}

/// Migrates every entry of `source` into `registry`.
pub fn migrate_legacy_handlers(
    source: &dyn LegacyHandlerSource,
    registry: &HandlerRegistry,
) -> MigrationReport {
    let mut report = MigrationReport {
        source: source.name().to_string(),
        ..MigrationReport::default()
    };

    for entry in source.entries() {
        let outcome = match entry {
            Ok(registration) => migrate_one(registration, registry),
            Err(error) => MigrationOutcome::Failed {
                handler_type: error.handler_type,
                error: error.reason,
            },
        };
        if let MigrationOutcome::Failed { handler_type, error } = &outcome {
            warn!("Migration of '{}' failed: {}", handler_type, error);
        }
        report.push(outcome);
    }

    info!(
        "Migrated handlers from '{}': {} migrated, {} skipped, {} failed",
        report.source, report.migrated, report.skipped, report.failed
    );
    report
}

fn migrate_one(registration: HandlerRegistration, registry: &HandlerRegistry) -> MigrationOutcome {
    let handler_type = registration.handler_type.clone();
    match registry.install_migrated(registration) {
        Ok(InstallOutcome::Installed) => MigrationOutcome::Migrated {
            handler_type,
            replaced: false,
        },
        Ok(InstallOutcome::Replaced) => MigrationOutcome::Migrated {
            handler_type,
            replaced: true,
        },
        Ok(InstallOutcome::SkippedNative) => MigrationOutcome::Skipped {
            handler_type,
            reason: "registered natively".to_string(),
        },
        Ok(InstallOutcome::SkippedSameVersion) => MigrationOutcome::Skipped {
            handler_type,
            reason: "already migrated".to_string(),
        },
        Err(EngineError::AdapterMismatch { reason, .. }) => MigrationOutcome::Failed {
            handler_type,
            error: reason,
        },
        Err(error) => MigrationOutcome::Failed {
            handler_type,
            error: error.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::traits::{LegacyFn, Service};
    use crate::test_support::RecordingHandler;
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::Arc;

    struct Billing;

    #[async_trait]
    impl Service for Billing {
        fn name(&self) -> &str {
            "billing"
        }

        fn methods(&self) -> Vec<String> {
            vec!["charge".to_string()]
        }

        async fn call(&self, _method: &str, _args: Map<String, Value>) -> std::result::Result<Value, String> {
            Ok(Value::Bool(true))
        }
    }

    struct OldRegistry {
        version: &'static str,
    }

    impl LegacyHandlerSource for OldRegistry {
        fn name(&self) -> &str {
            "old-registry"
        }

        fn entries(&self) -> Vec<LegacyEntry> {
            let function: LegacyFn = Arc::new(|args: Vec<Value>| Value::Array(args));
            vec![
                Ok(HandlerRegistration::legacy("resize", function, &["width", "height"])
                    .with_version(self.version)),
                Ok(HandlerRegistration::service("charge", Arc::new(Billing), "charge")),
                // Unknown method: fails without aborting the run
                Ok(HandlerRegistration::service("refund", Arc::new(Billing), "refund")),
                Err(LegacyEntryError::new("broken", "class not found")),
                Ok(HandlerRegistration::direct("echo", RecordingHandler::new())),
            ]
        }
    }

    fn registry_with_native_echo() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry
            .register(HandlerRegistration::direct("echo", RecordingHandler::new()))
            .unwrap();
        registry
    }

    #[test]
    fn test_migration_collects_partial_failures() {
        let registry = registry_with_native_echo();
        let report = migrate_legacy_handlers(&OldRegistry { version: "1" }, &registry);

        assert_eq!(report.source, "old-registry");
        assert_eq!(report.migrated, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.total(), 5);

        let failed: Vec<&str> = report.failures().map(|o| o.handler_type()).collect();
        assert_eq!(failed, vec!["refund", "broken"]);

        assert!(registry.contains("resize"));
        assert!(registry.contains("charge"));
        assert_eq!(registry.info("resize").unwrap().kind, "legacy");
    }

    #[test]
    fn test_migration_is_idempotent() {
        let registry = registry_with_native_echo();
        let source = OldRegistry { version: "1" };

        migrate_legacy_handlers(&source, &registry);
        let before = registry.list();

        let second = migrate_legacy_handlers(&source, &registry);
        assert_eq!(second.migrated, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(registry.list(), before);
    }

    #[test]
    fn test_migration_replaces_changed_version() {
        let registry = registry_with_native_echo();
        migrate_legacy_handlers(&OldRegistry { version: "1" }, &registry);

        let report = migrate_legacy_handlers(&OldRegistry { version: "2" }, &registry);
        assert_eq!(report.migrated, 1);
        assert!(report.outcomes.contains(&MigrationOutcome::Migrated {
            handler_type: "resize".to_string(),
            replaced: true,
        }));
        assert_eq!(registry.info("resize").unwrap().version, "2");
    }
}

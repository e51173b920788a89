//! Handler Registry
//!
//! Maps handler type strings to invocable handlers. The registry is an
//! explicit instance created once per process and shared by reference;
//! there is no global registry.
//!
//! # Concurrency
//!
//! A single registry-wide `RwLock` guards the table. Resolution takes the
//! read lock and clones an `Arc`, so a resolved handler keeps working even
//! if its registration is replaced afterwards. Mutation (register, replace,
//! migrate, unregister) takes the write lock.
//!
//! Every live [`ResolvedHandler`] and every [`HandlerClaim`] counts as one
//! use of its handler type; `unregister` refuses while the count is non-zero.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use log::{debug, info, trace};
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::monitoring::{AuditAction, HandlerTelemetry};
use crate::util::{lock, millis, read, write};

use super::factory::HandlerFactory;
use super::traits::{CommandHandler, Handler, HandlerContext, HandlerResult, LegacyFn, Service};

/// How a registered handler is invoked.
#[derive(Clone)]
pub enum HandlerKind {
    /// Implements the canonical contract directly
    Direct(Arc<dyn Handler>),
    /// Positional-argument function called with inputs in `arg_order`
    Legacy {
        function: LegacyFn,
        arg_order: Vec<String>,
    },
    /// Command-bus handler receiving `command` objects
    Command {
        handler: Arc<dyn CommandHandler>,
        command: String,
    },
    /// Method on a long-lived service object
    Service {
        service: Arc<dyn Service>,
        method: String,
    },
}

impl HandlerKind {
    pub fn label(&self) -> &'static str {
        match self {
            HandlerKind::Direct(_) => "direct",
            HandlerKind::Legacy { .. } => "legacy",
            HandlerKind::Command { .. } => "command",
            HandlerKind::Service { .. } => "service",
        }
    }
}

impl fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Direct(_) => f.write_str("Direct"),
            HandlerKind::Legacy { arg_order, .. } => {
                f.debug_struct("Legacy").field("arg_order", arg_order).finish()
            }
            HandlerKind::Command { command, .. } => {
                f.debug_struct("Command").field("command", command).finish()
            }
            HandlerKind::Service { method, .. } => {
                f.debug_struct("Service").field("method", method).finish()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HandlerCapabilities {
    /// Implements a real `execute_batch`, so the optimizer may merge steps
    pub batch: bool,
}

/// Where a registration came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationOrigin {
    #[default]
    Native,
    Migrated,
}

/// A handler type and how to invoke it.
#[derive(Debug, Clone)]
pub struct HandlerRegistration {
    pub handler_type: String,
    pub display_name: String,
    pub version: String,
    pub capabilities: HandlerCapabilities,
    pub active: bool,
    pub origin: RegistrationOrigin,
    pub kind: HandlerKind,
}

impl HandlerRegistration {
    pub fn new(handler_type: impl Into<String>, kind: HandlerKind) -> Self {
        let handler_type = handler_type.into();
        Self {
            display_name: handler_type.clone(),
            handler_type,
            version: "1".to_string(),
            capabilities: HandlerCapabilities::default(),
            active: true,
            origin: RegistrationOrigin::Native,
            kind,
        }
    }

    pub fn direct(handler_type: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self::new(handler_type, HandlerKind::Direct(handler))
    }

    pub fn legacy(handler_type: impl Into<String>, function: LegacyFn, arg_order: &[&str]) -> Self {
        Self::new(
            handler_type,
            HandlerKind::Legacy {
                function,
                arg_order: arg_order.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    pub fn command(
        handler_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
        command: impl Into<String>,
    ) -> Self {
        Self::new(
            handler_type,
            HandlerKind::Command {
                handler,
                command: command.into(),
            },
        )
    }

    pub fn service(
        handler_type: impl Into<String>,
        service: Arc<dyn Service>,
        method: impl Into<String>,
    ) -> Self {
        Self::new(
            handler_type,
            HandlerKind::Service {
                service,
                method: method.into(),
            },
        )
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_batch(mut self, batch: bool) -> Self {
        self.capabilities.batch = batch;
        self
    }

    pub fn with_origin(mut self, origin: RegistrationOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Serializable description of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationInfo {
    pub handler_type: String,
    pub display_name: String,
    pub version: String,
    pub capabilities: HandlerCapabilities,
    pub active: bool,
    pub origin: RegistrationOrigin,
    pub kind: &'static str,
}

impl From<&HandlerRegistration> for RegistrationInfo {
    fn from(registration: &HandlerRegistration) -> Self {
        Self {
            handler_type: registration.handler_type.clone(),
            display_name: registration.display_name.clone(),
            version: registration.version.clone(),
            capabilities: registration.capabilities,
            active: registration.active,
            origin: registration.origin,
            kind: registration.kind.label(),
        }
    }
}

/// What [`HandlerRegistry::install_migrated`] did with a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallOutcome {
    Installed,
    Replaced,
    SkippedNative,
    SkippedSameVersion,
}

struct Entry {
    registration: HandlerRegistration,
    invocable: Arc<dyn Handler>,
}

/// Outstanding uses per handler type.
#[derive(Debug, Default)]
struct UsageCounts {
    counts: Mutex<HashMap<String, usize>>,
}

impl UsageCounts {
    fn acquire(self: &Arc<Self>, handler_type: &str) -> UsageGuard {
        *lock(&self.counts)
            .entry(handler_type.to_string())
            .or_insert(0) += 1;
        UsageGuard {
            counts: Arc::clone(self),
            handler_type: handler_type.to_string(),
        }
    }

    fn count(&self, handler_type: &str) -> usize {
        lock(&self.counts).get(handler_type).copied().unwrap_or(0)
    }
}

/// One use of a handler type, released on drop.
#[derive(Debug)]
struct UsageGuard {
    counts: Arc<UsageCounts>,
    handler_type: String,
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        let mut counts = lock(&self.counts.counts);
        if let Some(count) = counts.get_mut(&self.handler_type) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.handler_type);
            }
        }
    }
}

/// Keeps handler types registered for an execution that has not resolved
/// them yet. Released on drop.
#[derive(Debug)]
pub struct HandlerClaim {
    guards: Vec<UsageGuard>,
}

impl HandlerClaim {
    /// Handler types held by this claim.
    pub fn handler_types(&self) -> impl Iterator<Item = &str> {
        self.guards.iter().map(|guard| guard.handler_type.as_str())
    }
}

/// A handler ready to be invoked.
///
/// Holding it marks the handler as in use; see [`HandlerRegistry::unregister`].
#[derive(Clone)]
pub struct ResolvedHandler {
    pub handler_type: String,
    pub version: String,
    pub capabilities: HandlerCapabilities,
    invocable: Arc<dyn Handler>,
    telemetry: Option<Arc<HandlerTelemetry>>,
    _usage: Arc<UsageGuard>,
}

impl ResolvedHandler {
    /// Invokes the handler and records the invocation.
    pub async fn invoke(&self, ctx: HandlerContext) -> HandlerResult {
        let execution_id = ctx.execution_id.clone();
        let started = Instant::now();
        let result = self.invocable.execute(ctx).await;
        self.record(&execution_id, started, result.as_ref().err().map(|e| e.to_string()));
        result
    }

    /// Invokes the handler once for several contexts.
    pub async fn invoke_batch(&self, contexts: Vec<HandlerContext>) -> Vec<HandlerResult> {
        let execution_id = contexts
            .first()
            .map(|ctx| ctx.execution_id.clone())
            .unwrap_or_default();
        let expected = contexts.len();
        let started = Instant::now();
        let results = self.invocable.execute_batch(contexts).await;

        let failure = results
            .iter()
            .find_map(|result| result.as_ref().err().map(|e| e.to_string()))
            .or_else(|| {
                (results.len() != expected).then(|| {
                    format!("batch returned {} results for {} steps", results.len(), expected)
                })
            });
        self.record(&execution_id, started, failure);
        results
    }

    fn record(&self, execution_id: &str, started: Instant, failure: Option<String>) {
        let duration_ms = millis(started.elapsed());
        trace!(
            "Invoked '{}' in {} ms (success: {})",
            self.handler_type,
            duration_ms,
            failure.is_none()
        );
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_invocation(&self.handler_type, execution_id, duration_ms, failure);
        }
    }
}

impl fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("handler_type", &self.handler_type)
            .field("version", &self.version)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Registry of handler types.
pub struct HandlerRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    usage: Arc<UsageCounts>,
    telemetry: Option<Arc<HandlerTelemetry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            usage: Arc::new(UsageCounts::default()),
            telemetry: None,
        }
    }

    /// Records resolutions, invocations and registry changes.
    pub fn with_telemetry(mut self, telemetry: Arc<HandlerTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn telemetry(&self) -> Option<&Arc<HandlerTelemetry>> {
        self.telemetry.as_ref()
    }

    /// Registers a new handler type.
    ///
    /// Fails with `DuplicateRegistration` when an active registration of
    /// the same type exists; use [`HandlerRegistry::replace`] to override.
    pub fn register(&self, registration: HandlerRegistration) -> Result<()> {
        let invocable = HandlerFactory::create(&registration)?;
        let handler_type = registration.handler_type.clone();

        let mut entries = write(&self.entries);
        if entries
            .get(&handler_type)
            .map_or(false, |entry| entry.registration.active)
        {
            drop(entries);
            self.audit(AuditAction::Register, &handler_type, false, Some("duplicate"));
            return Err(EngineError::DuplicateRegistration(handler_type));
        }

        info!(
            "Registered handler '{}' ({}, v{})",
            handler_type,
            registration.kind.label(),
            registration.version
        );
        entries.insert(
            handler_type.clone(),
            Entry {
                registration,
                invocable,
            },
        );
        drop(entries);
        self.audit(AuditAction::Register, &handler_type, true, None);
        Ok(())
    }

    /// Registers a handler type, overriding any existing registration.
    ///
    /// Executions that already resolved the old handler keep using it.
    /// Returns whether a registration was replaced.
    pub fn replace(&self, registration: HandlerRegistration) -> Result<bool> {
        let invocable = HandlerFactory::create(&registration)?;
        let handler_type = registration.handler_type.clone();

        let previous = write(&self.entries).insert(
            handler_type.clone(),
            Entry {
                registration,
                invocable,
            },
        );
        info!("Replaced handler '{}'", handler_type);
        self.audit(AuditAction::Replace, &handler_type, true, None);
        Ok(previous.is_some())
    }

    /// Installs a migrated registration unless a native one, or a migrated
    /// one of the same version, is already present.
    pub(crate) fn install_migrated(&self, registration: HandlerRegistration) -> Result<InstallOutcome> {
        let registration = registration.with_origin(RegistrationOrigin::Migrated);
        let handler_type = registration.handler_type.clone();

        let mut entries = write(&self.entries);
        let outcome = match entries.get(&handler_type) {
            Some(entry) if entry.registration.origin == RegistrationOrigin::Native => {
                InstallOutcome::SkippedNative
            }
            Some(entry) if entry.registration.version == registration.version => {
                InstallOutcome::SkippedSameVersion
            }
            Some(_) => InstallOutcome::Replaced,
            None => InstallOutcome::Installed,
        };

        if matches!(outcome, InstallOutcome::Installed | InstallOutcome::Replaced) {
            let invocable = HandlerFactory::create(&registration)?;
            entries.insert(
                handler_type.clone(),
                Entry {
                    registration,
                    invocable,
                },
            );
            drop(entries);
            debug!("Installed migrated handler '{}' ({:?})", handler_type, outcome);
            self.audit(AuditAction::Migrate, &handler_type, true, None);
        }
        Ok(outcome)
    }

    /// Looks up an active handler.
    pub fn resolve(&self, handler_type: &str) -> Result<ResolvedHandler> {
        let resolved = read(&self.entries)
            .get(handler_type)
            .filter(|entry| entry.registration.active)
            .map(|entry| ResolvedHandler {
                handler_type: entry.registration.handler_type.clone(),
                version: entry.registration.version.clone(),
                capabilities: entry.registration.capabilities,
                invocable: Arc::clone(&entry.invocable),
                telemetry: self.telemetry.clone(),
                _usage: Arc::new(self.usage.acquire(handler_type)),
            });

        if let Some(telemetry) = &self.telemetry {
            telemetry.record_resolution(handler_type, resolved.is_some());
        }
        resolved.ok_or_else(|| EngineError::HandlerNotFound(handler_type.to_string()))
    }

    /// Marks handler types as needed by a pending execution until the
    /// returned claim is dropped.
    pub fn claim<'a>(&self, handler_types: impl IntoIterator<Item = &'a str>) -> HandlerClaim {
        let distinct: BTreeSet<&str> = handler_types.into_iter().collect();
        HandlerClaim {
            guards: distinct
                .into_iter()
                .map(|handler_type| self.usage.acquire(handler_type))
                .collect(),
        }
    }

    /// Outstanding resolutions and claims for a handler type.
    pub fn usage_count(&self, handler_type: &str) -> usize {
        self.usage.count(handler_type)
    }

    /// Whether an active registration exists for the type.
    pub fn contains(&self, handler_type: &str) -> bool {
        read(&self.entries)
            .get(handler_type)
            .map_or(false, |entry| entry.registration.active)
    }

    /// Enables or disables a registration without removing it.
    pub fn set_active(&self, handler_type: &str, active: bool) -> Result<()> {
        let mut entries = write(&self.entries);
        let entry = entries
            .get_mut(handler_type)
            .ok_or_else(|| EngineError::HandlerNotFound(handler_type.to_string()))?;
        entry.registration.active = active;
        debug!("Handler '{}' active: {}", handler_type, active);
        Ok(())
    }

    /// Removes a registration.
    ///
    /// Refuses with `HandlerInUse` while a [`ResolvedHandler`] or a
    /// [`HandlerClaim`] for the type is alive, i.e. while a queued or
    /// running execution may still dispatch it.
    pub fn unregister(&self, handler_type: &str) -> Result<HandlerRegistration> {
        let mut entries = write(&self.entries);
        if !entries.contains_key(handler_type) {
            return Err(EngineError::HandlerNotFound(handler_type.to_string()));
        }

        if self.usage.count(handler_type) > 0 {
            drop(entries);
            self.audit(AuditAction::Unregister, handler_type, false, Some("in use"));
            return Err(EngineError::HandlerInUse(handler_type.to_string()));
        }

        let removed = entries.remove(handler_type).map(|entry| entry.registration);
        drop(entries);
        self.audit(AuditAction::Unregister, handler_type, true, None);
        info!("Unregistered handler '{}'", handler_type);
        removed.ok_or_else(|| EngineError::HandlerNotFound(handler_type.to_string()))
    }

    pub fn info(&self, handler_type: &str) -> Option<RegistrationInfo> {
        read(&self.entries)
            .get(handler_type)
            .map(|entry| RegistrationInfo::from(&entry.registration))
    }

    /// Every registration, ordered by handler type.
    pub fn list(&self) -> Vec<RegistrationInfo> {
        let mut infos: Vec<RegistrationInfo> = read(&self.entries)
            .values()
            .map(|entry| RegistrationInfo::from(&entry.registration))
            .collect();
        infos.sort_by(|a, b| a.handler_type.cmp(&b.handler_type));
        infos
    }

    /// Active handler types that support batched dispatch.
    pub fn batchable_types(&self) -> BTreeSet<String> {
        read(&self.entries)
            .values()
            .filter(|entry| entry.registration.active && entry.registration.capabilities.batch)
            .map(|entry| entry.registration.handler_type.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn audit(&self, action: AuditAction, handler_type: &str, success: bool, detail: Option<&str>) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_registry_change(action, handler_type, success, detail);
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, RecordingHandler};
    use serde_json::{json, Value};

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new().with_telemetry(Arc::new(HandlerTelemetry::new(100)))
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = registry();
        registry
            .register(HandlerRegistration::direct("echo", RecordingHandler::new()).with_version("2"))
            .unwrap();

        let resolved = registry.resolve("echo").unwrap();
        assert_eq!(resolved.handler_type, "echo");
        assert_eq!(resolved.version, "2");
        assert!(registry.contains("echo"));
        assert!(!registry.contains("other"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = registry();
        registry
            .register(HandlerRegistration::direct("echo", RecordingHandler::new()))
            .unwrap();

        let result = registry.register(HandlerRegistration::direct("echo", RecordingHandler::new()));
        assert!(matches!(result, Err(EngineError::DuplicateRegistration(t)) if t == "echo"));

        // Explicit override is allowed
        assert!(registry
            .replace(HandlerRegistration::direct("echo", RecordingHandler::new()).with_version("2"))
            .unwrap());
        assert_eq!(registry.info("echo").unwrap().version, "2");
    }

    #[test]
    fn test_inactive_registration_not_resolvable() {
        let registry = registry();
        registry
            .register(HandlerRegistration::direct("echo", RecordingHandler::new()).inactive())
            .unwrap();

        assert!(matches!(
            registry.resolve("echo"),
            Err(EngineError::HandlerNotFound(_))
        ));
        assert!(!registry.contains("echo"));

        // An inactive type may be registered again
        registry
            .register(HandlerRegistration::direct("echo", RecordingHandler::new()))
            .unwrap();
        assert!(registry.contains("echo"));

        registry.set_active("echo", false).unwrap();
        assert!(!registry.contains("echo"));
    }

    #[test]
    fn test_unregister_refused_while_in_use() {
        let registry = registry();
        registry
            .register(HandlerRegistration::direct("echo", RecordingHandler::new()))
            .unwrap();

        let resolved = registry.resolve("echo").unwrap();
        assert!(matches!(
            registry.unregister("echo"),
            Err(EngineError::HandlerInUse(_))
        ));

        let copy = resolved.clone();
        drop(resolved);
        assert_eq!(registry.usage_count("echo"), 1);
        drop(copy);

        let removed = registry.unregister("echo").unwrap();
        assert_eq!(removed.handler_type, "echo");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_unused_direct_handler() {
        let registry = registry();
        registry
            .register(HandlerRegistration::direct("echo", RecordingHandler::new()))
            .unwrap();

        assert_eq!(registry.usage_count("echo"), 0);
        assert!(registry.unregister("echo").is_ok());
        assert!(matches!(
            registry.unregister("echo"),
            Err(EngineError::HandlerNotFound(_))
        ));
    }

    #[test]
    fn test_claim_blocks_unregister_until_dropped() {
        let registry = registry();
        registry
            .register(HandlerRegistration::direct("echo", RecordingHandler::new()))
            .unwrap();
        registry
            .register(HandlerRegistration::direct("other", RecordingHandler::new()))
            .unwrap();

        let claim = registry.claim(["echo", "echo"]);
        assert_eq!(claim.handler_types().collect::<Vec<_>>(), vec!["echo"]);
        assert_eq!(registry.usage_count("echo"), 1);
        assert!(matches!(
            registry.unregister("echo"),
            Err(EngineError::HandlerInUse(_))
        ));
        assert!(registry.unregister("other").is_ok());

        drop(claim);
        assert!(registry.unregister("echo").is_ok());
    }

    #[tokio::test]
    async fn test_replaced_handler_keeps_serving_resolved_callers() {
        let registry = registry();
        let first = RecordingHandler::new();
        registry
            .register(HandlerRegistration::direct("echo", first.clone()))
            .unwrap();
        let resolved = registry.resolve("echo").unwrap();

        let second = RecordingHandler::new();
        registry
            .replace(HandlerRegistration::direct("echo", second.clone()))
            .unwrap();

        resolved.invoke(context("echo", json!({"n": 1}))).await.unwrap();
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_invocations_recorded_in_telemetry() {
        let registry = registry();
        let function: LegacyFn = Arc::new(|args: Vec<Value>| args[0].clone());
        registry
            .register(HandlerRegistration::legacy("legacy", function, &["value"]))
            .unwrap();

        let resolved = registry.resolve("legacy").unwrap();
        let output = resolved.invoke(context("legacy", json!({"value": 7}))).await.unwrap();
        assert_eq!(output, json!(7));
        let _ = registry.resolve("missing");

        let telemetry = registry.telemetry().unwrap();
        let stats = telemetry.metrics().get("legacy").unwrap();
        assert_eq!(stats.resolutions, 1);
        assert_eq!(stats.invocations, 1);
        assert_eq!(telemetry.metrics().get("missing").unwrap().resolution_failures, 1);
        assert!(!telemetry.audit().for_handler("legacy", 10).is_empty());
    }

    #[test]
    fn test_batchable_types_and_list() {
        let registry = registry();
        registry
            .register(HandlerRegistration::direct("bulk", RecordingHandler::new()).with_batch(true))
            .unwrap();
        registry
            .register(HandlerRegistration::direct("echo", RecordingHandler::new()))
            .unwrap();

        assert_eq!(
            registry.batchable_types().into_iter().collect::<Vec<_>>(),
            vec!["bulk".to_string()]
        );
        let list = registry.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].handler_type, "bulk");
        assert_eq!(list[1].kind, "direct");
        assert_eq!(list[1].origin, RegistrationOrigin::Native);
    }

    #[test]
    fn test_install_migrated_respects_native() {
        let registry = registry();
        registry
            .register(HandlerRegistration::direct("echo", RecordingHandler::new()))
            .unwrap();

        let outcome = registry
            .install_migrated(HandlerRegistration::direct("echo", RecordingHandler::new()))
            .unwrap();
        assert_eq!(outcome, InstallOutcome::SkippedNative);

        let outcome = registry
            .install_migrated(HandlerRegistration::direct("old", RecordingHandler::new()))
            .unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(registry.info("old").unwrap().origin, RegistrationOrigin::Migrated);

        let outcome = registry
            .install_migrated(HandlerRegistration::direct("old", RecordingHandler::new()))
            .unwrap();
        assert_eq!(outcome, InstallOutcome::SkippedSameVersion);

        let outcome = registry
            .install_migrated(HandlerRegistration::direct("old", RecordingHandler::new()).with_version("2"))
            .unwrap();
        assert_eq!(outcome, InstallOutcome::Replaced);
    }
}

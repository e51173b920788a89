//! Unified Handler System
//!
//! Decouples the handler type a step declares from how that handler is
//! actually invoked.
//!
//! # Structure
//!
//! - [`traits`]: the canonical [`Handler`] contract and the older shapes
//! - [`adapters`]: legacy, command and service adapters
//! - [`factory`]: the single place adapter selection happens
//! - [`registry`]: handler type to invocable mapping
//! - [`migration`]: re-runnable import of handlers from an external source
//! - [`builtin`]: handlers shipped with the runtime

pub mod adapters;
pub mod builtin;
pub mod factory;
pub mod migration;
pub mod registry;
pub mod traits;

pub use adapters::{CommandHandlerAdapter, LegacyHandlerAdapter, ServiceHandlerAdapter};
pub use builtin::register_builtin_handlers;
pub use factory::HandlerFactory;
pub use migration::{
    migrate_legacy_handlers, LegacyEntry, LegacyEntryError, LegacyHandlerSource, MigrationOutcome,
    MigrationReport,
};
pub use registry::{
    HandlerCapabilities, HandlerClaim, HandlerKind, HandlerRegistration, HandlerRegistry,
    RegistrationInfo, RegistrationOrigin, ResolvedHandler,
};
pub use traits::{
    Command, CommandHandler, CommandOutcome, Handler, HandlerContext, HandlerError, HandlerResult,
    LegacyFn, Service,
};

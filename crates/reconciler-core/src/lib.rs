//! Reconciling resource installer.
//!
//! Independent producers declare which artifacts (modules, configuration
//! objects) should exist in a running component platform. The installer
//! diffs each declaration against what the producer declared before and what
//! was already applied, then drives the runtime to the desired state through
//! pluggable processors:
//!
//! - [`Installer`]: producer entry points and the background loop
//! - [`ResourceRegistry`]: per-scheme snapshots and winner selection
//! - [`OverrideRules`]: priority comparator for competing producers
//! - [`TaskQueue`] / [`Executor`]: ordered, collapsing queue and the
//!   single-in-flight execution pass
//! - [`ResourceProcessor`]: the SPI a runtime integration implements
//! - [`TrackingStore`]: durable record of what was applied
//! - [`Reporter`]: asynchronous outcome channel
//!
//! # Example
//!
//! ```ignore
//! use reconciler_core::{Installer, InstallerConfig, InstallableResource, ProcessorRegistry};
//!
//! let installer = Installer::open(config, ProcessorRegistry::new().with(modules))?;
//! installer.register_resources("fs", vec![
//!     InstallableResource::module("/apps/a.jar", "org.example.a").with_bytes(bytes),
//! ])?;
//! let mut events = installer.subscribe();
//! tokio::spawn(async move { installer.run(shutdown).await });
//! ```

mod config;
mod error;
mod executor;
mod installer;
mod override_rules;
mod processor;
mod queue;
mod registry;
mod report;
mod resource;
mod retry;
mod store;
mod task;

pub use config::InstallerConfig;
pub use error::{
    ExecResult, ExecutionError, InstallerError, InstallerResult, PersistResult,
    PersistenceError, ValidationError,
};
pub use executor::{Executor, PassSummary};
pub use installer::{CandidateState, EntityState, Installer, RegistrationAck};
pub use override_rules::{OverrideRule, OverrideRules};
pub use processor::{ProcessorRegistry, ResourceProcessor};
pub use queue::{EnqueueEffect, TaskQueue};
pub use registry::{EntityView, RegistrationOutcome, ResourceRegistry};
pub use report::{InstallEvent, InstallerStats, Reporter, TaskOutcome};
pub use resource::{
    resource_url, InstallableResource, Payload, RegisteredResource, ResourceKind,
    DEFAULT_PRIORITY,
};
pub use retry::RetryPolicy;
pub use store::{
    FileBackend, LastOperation, MemoryBackend, ProcessorState, TrackedEntity, TrackingBackend,
    TrackingStore, RECORD_VERSION,
};
pub use task::{Task, TaskOperation, TaskState};

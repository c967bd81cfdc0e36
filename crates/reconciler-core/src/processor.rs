//! Processor SPI and kind-based dispatch.
//!
//! A [`ResourceProcessor`] performs the real runtime action for one or more
//! [`ResourceKind`]s. The installer routes each task through a
//! [`ProcessorRegistry`], a plain kind → processor table resolved once per
//! task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{ExecResult, ExecutionError};
use crate::resource::{RegisteredResource, ResourceKind};
use crate::store::ProcessorState;

/// Performs install/update/uninstall actions in the target runtime.
///
/// Processors report failures as values: [`ExecutionError::Transient`] when
/// the same call may succeed later, [`ExecutionError::Permanent`] when it
/// never will. The installer guarantees at most one call in flight across
/// all processors, and per-entity calls in task creation order.
#[async_trait]
pub trait ResourceProcessor: Send + Sync {
    /// Returns the processor name (for logging).
    fn name(&self) -> &str;

    /// Returns the kinds this processor handles.
    fn kinds(&self) -> Vec<ResourceKind>;

    /// Installs `resource`, or updates the entity to it when `prior` is set.
    ///
    /// Returns the processor state to persist with the entity.
    async fn install_or_update(
        &self,
        resource: &RegisteredResource,
        prior: Option<&ProcessorState>,
    ) -> ExecResult<ProcessorState>;

    /// Removes an installed entity.
    async fn uninstall(&self, entity_id: &str, prior: &ProcessorState) -> ExecResult<()>;
}

/// Dispatch table from kind to processor.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    by_kind: HashMap<ResourceKind, Arc<dyn ResourceProcessor>>,
}

impl ProcessorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor for every kind it declares.
    ///
    /// A later registration for a kind replaces the earlier one.
    pub fn register(&mut self, processor: Arc<dyn ResourceProcessor>) {
        for kind in processor.kinds() {
            info!("Registering processor {} for kind {}", processor.name(), kind);
            if let Some(previous) = self.by_kind.insert(kind, Arc::clone(&processor)) {
                warn!(
                    "Processor {} replaces {} for kind {}",
                    processor.name(),
                    previous.name(),
                    kind
                );
            }
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, processor: Arc<dyn ResourceProcessor>) -> Self {
        self.register(processor);
        self
    }

    /// Returns the processor for `kind`.
    pub fn resolve(&self, kind: ResourceKind) -> ExecResult<Arc<dyn ResourceProcessor>> {
        self.by_kind
            .get(&kind)
            .cloned()
            .ok_or(ExecutionError::NoProcessor { kind })
    }

    /// Returns true if a processor handles `kind`.
    pub fn handles(&self, kind: ResourceKind) -> bool {
        self.by_kind.contains_key(&kind)
    }

    /// Returns the number of kinds with a processor.
    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    /// Returns true if no processor is registered.
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (kind, p) in &self.by_kind {
            map.entry(kind, &p.name());
        }
        map.finish()
    }
}

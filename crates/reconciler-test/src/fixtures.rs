//! Test fixtures for common installer patterns
//!
//! Provides resource builders, a scriptable processor that records every
//! call, and a tracking backend whose writes can be made to fail.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reconciler_core::{
    ExecResult, ExecutionError, InstallableResource, MemoryBackend, PersistResult,
    PersistenceError, ProcessorState, RegisteredResource, ResourceKind, ResourceProcessor,
    TrackedEntity, TrackingBackend, DEFAULT_PRIORITY,
};
use serde_json::json;
use tracing::debug;

/// Module resource fixtures
pub mod module_fixtures {
    use super::*;

    /// Module with an explicit digest and priority
    pub fn module(id: &str, entity_id: &str, digest: &str, priority: i32) -> InstallableResource {
        InstallableResource::module(id, entity_id)
            .with_digest(digest)
            .with_priority(priority)
    }

    /// Module whose digest is computed from its bytes
    pub fn module_with_bytes(id: &str, entity_id: &str, bytes: &[u8]) -> InstallableResource {
        InstallableResource::module(id, entity_id).with_bytes(bytes.to_vec())
    }

    /// Module set `prefix-0 .. prefix-(count-1)`, one entity each
    pub fn module_set(prefix: &str, count: usize, digest: &str) -> Vec<InstallableResource> {
        (0..count)
            .map(|i| {
                module(
                    &format!("{}-{}.jar", prefix, i),
                    &format!("{}.{}", prefix, i),
                    digest,
                    DEFAULT_PRIORITY,
                )
            })
            .collect()
    }
}

/// Configuration resource fixtures
pub mod config_fixtures {
    use super::*;

    /// Configuration object with the given properties
    pub fn config<I, K>(id: &str, pid: &str, properties: I) -> InstallableResource
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        properties
            .into_iter()
            .fold(InstallableResource::config(id, pid), |r, (k, v)| {
                r.with_property(k, v)
            })
    }

    /// Logging configuration at a given level
    pub fn logging(level: &str) -> InstallableResource {
        config(
            "logging.cfg",
            "org.example.logging",
            [("level", json!(level)), ("appender", json!("console"))],
        )
    }
}

/// One recorded processor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorCall {
    /// `install_or_update` was called
    InstallOrUpdate {
        /// Target entity
        entity_id: String,
        /// Resource URL
        url: String,
        /// Resource digest
        digest: String,
        /// Whether prior state was passed in
        update: bool,
    },
    /// `uninstall` was called
    Uninstall {
        /// Target entity
        entity_id: String,
    },
}

impl ProcessorCall {
    /// Returns the entity the call targeted.
    pub fn entity_id(&self) -> &str {
        match self {
            ProcessorCall::InstallOrUpdate { entity_id, .. } => entity_id,
            ProcessorCall::Uninstall { entity_id } => entity_id,
        }
    }
}

/// Processor that records calls and fails on demand.
///
/// Failures are scripted per entity and consumed one per call; once an
/// entity's script is empty, calls succeed.
#[derive(Debug)]
pub struct ScriptedProcessor {
    name: String,
    kinds: Vec<ResourceKind>,
    calls: Mutex<Vec<ProcessorCall>>,
    script: Mutex<HashMap<String, VecDeque<ExecutionError>>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProcessor {
    /// Creates a processor for the given kinds.
    pub fn new(name: impl Into<String>, kinds: Vec<ResourceKind>) -> Self {
        Self {
            name: name.into(),
            kinds,
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(HashMap::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Module processor.
    pub fn modules() -> Self {
        Self::new("modules", vec![ResourceKind::Module])
    }

    /// Configuration processor.
    pub fn configs() -> Self {
        Self::new("configs", vec![ResourceKind::Config])
    }

    /// Makes every call take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues one failure for the next call on `entity_id`.
    pub fn fail_next(&self, entity_id: &str, error: ExecutionError) {
        self.script
            .lock()
            .entry(entity_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Queues `times` transient failures for `entity_id`.
    pub fn fail_transiently(&self, entity_id: &str, times: usize) {
        for i in 0..times {
            self.fail_next(
                entity_id,
                ExecutionError::transient(format!("dependency not resolvable ({})", i + 1)),
            );
        }
    }

    /// Returns every call so far, in order.
    pub fn calls(&self) -> Vec<ProcessorCall> {
        self.calls.lock().clone()
    }

    /// Returns the calls that targeted `entity_id`.
    pub fn calls_for(&self, entity_id: &str) -> Vec<ProcessorCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.entity_id() == entity_id)
            .cloned()
            .collect()
    }

    /// Returns the number of calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the highest number of simultaneous calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: ProcessorCall) -> ExecResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let entity_id = call.entity_id().to_string();
        debug!("{}: {:?}", self.name, call);
        self.calls.lock().push(call);

        let scripted = self
            .script
            .lock()
            .get_mut(&entity_id)
            .and_then(VecDeque::pop_front);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match scripted {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceProcessor for ScriptedProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> Vec<ResourceKind> {
        self.kinds.clone()
    }

    async fn install_or_update(
        &self,
        resource: &RegisteredResource,
        prior: Option<&ProcessorState>,
    ) -> ExecResult<ProcessorState> {
        self.enter(ProcessorCall::InstallOrUpdate {
            entity_id: resource.entity_id.clone(),
            url: resource.url.clone(),
            digest: resource.digest.clone(),
            update: prior.is_some(),
        })
        .await?;

        let generation = prior
            .and_then(|p| p.get("generation"))
            .and_then(|g| g.as_u64())
            .map_or(1, |g| g + 1);
        let mut state = ProcessorState::new();
        state.insert("generation".to_string(), json!(generation));
        state.insert("source".to_string(), json!(resource.url));
        Ok(state)
    }

    async fn uninstall(&self, entity_id: &str, _prior: &ProcessorState) -> ExecResult<()> {
        self.enter(ProcessorCall::Uninstall {
            entity_id: entity_id.to_string(),
        })
        .await
    }
}

#[derive(Debug, Default)]
struct FlakyState {
    records: MemoryBackend,
    failing_writes: AtomicUsize,
    failing_deletes: AtomicUsize,
    writes: AtomicUsize,
}

/// In-memory tracking backend with injectable flush failures.
///
/// Clones share the same records, so a clone kept by the test can be used
/// to reopen a store after a simulated restart.
#[derive(Debug, Clone, Default)]
pub struct FlakyBackend {
    state: Arc<FlakyState>,
}

impl FlakyBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding `records`.
    pub fn with_records(records: impl IntoIterator<Item = TrackedEntity>) -> Self {
        Self {
            state: Arc::new(FlakyState {
                records: MemoryBackend::with_records(records),
                ..Default::default()
            }),
        }
    }

    /// Makes the next `count` writes fail.
    pub fn fail_writes(&self, count: usize) {
        self.state.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` deletes fail.
    pub fn fail_deletes(&self, count: usize) {
        self.state.failing_deletes.store(count, Ordering::SeqCst);
    }

    /// Returns the number of successful writes.
    pub fn write_count(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }

    /// Returns the durable records, keyed by entity id.
    pub fn records(&self) -> BTreeMap<String, TrackedEntity> {
        self.state
            .records
            .load_all()
            .unwrap_or_default()
            .into_iter()
            .map(|r| (r.entity_id.clone(), r))
            .collect()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TrackingBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    fn load_all(&self) -> PersistResult<Vec<TrackedEntity>> {
        self.state.records.load_all()
    }

    fn write(&self, entity: &TrackedEntity) -> PersistResult<()> {
        if Self::take_failure(&self.state.failing_writes) {
            return Err(PersistenceError::backend("injected write failure"));
        }
        self.state.records.write(entity)?;
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, entity_id: &str) -> PersistResult<()> {
        if Self::take_failure(&self.state.failing_deletes) {
            return Err(PersistenceError::backend("injected delete failure"));
        }
        self.state.records.delete(entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let processor = ScriptedProcessor::modules();
        processor.fail_transiently("e1", 1);
        processor.fail_next("e1", ExecutionError::permanent("corrupt"));

        let resource = RegisteredResource::validate(
            "fs",
            module_fixtures::module("a.jar", "e1", "d1", 5),
        )
        .unwrap();

        assert!(processor
            .install_or_update(&resource, None)
            .await
            .unwrap_err()
            .is_retryable());
        assert!(!processor
            .install_or_update(&resource, None)
            .await
            .unwrap_err()
            .is_retryable());
        let state = processor.install_or_update(&resource, None).await.unwrap();
        assert_eq!(state["generation"], json!(1));

        let updated = processor
            .install_or_update(&resource, Some(&state))
            .await
            .unwrap();
        assert_eq!(updated["generation"], json!(2));
        assert_eq!(processor.call_count(), 4);
        assert_eq!(processor.max_in_flight(), 1);
    }

    #[test]
    fn test_flaky_backend_counts_down_failures() {
        let backend = FlakyBackend::new();
        let resource = RegisteredResource::validate(
            "fs",
            module_fixtures::module("a.jar", "e1", "d1", 5),
        )
        .unwrap();
        let entity = TrackedEntity::installed(&resource, ProcessorState::new());

        backend.fail_writes(1);
        assert!(backend.write(&entity).is_err());
        assert!(backend.write(&entity).is_ok());
        assert_eq!(backend.write_count(), 1);

        let shared = backend.clone();
        assert_eq!(shared.records().len(), 1);
    }

    #[test]
    fn test_config_fixture_is_structured() {
        let resource = config_fixtures::logging("debug");
        let registered = RegisteredResource::validate("console", resource).unwrap();
        assert_eq!(registered.kind, ResourceKind::Config);
        assert_eq!(
            registered.payload.as_properties().unwrap()["level"],
            json!("debug")
        );
    }

    #[test]
    fn test_module_set() {
        let set = module_fixtures::module_set("app", 3, "d1");
        assert_eq!(set.len(), 3);
        assert_eq!(set[2].entity_id, "app.2");
    }
}

//! Installer facade: the producer API and the background loop.
//!
//! ```text
//!  producers ──register/update──▶ ResourceRegistry ──tasks──▶ TaskQueue
//!                                       │                         │
//!                                 OverrideRules               Executor ──▶ processors
//!                                                                 │
//!                                   TrackingStore ◀───────────────┘
//!                                                                 │
//!                                       Reporter ◀────────────────┘
//! ```
//!
//! Registration calls only touch in-memory structures and return as soon as
//! their tasks are queued. Processor calls happen in [`Installer::run_pass`],
//! driven by [`Installer::run`] or by the embedding application.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InstallerConfig;
use crate::error::{InstallerError, InstallerResult, ValidationError};
use crate::executor::{Executor, PassSummary};
use crate::override_rules::{OverrideRule, OverrideRules};
use crate::processor::ProcessorRegistry;
use crate::queue::{EnqueueEffect, TaskQueue};
use crate::registry::{RegistrationOutcome, ResourceRegistry};
use crate::report::{InstallEvent, InstallerStats, Reporter, TaskOutcome};
use crate::resource::InstallableResource;
use crate::store::{FileBackend, TrackedEntity, TrackingStore};
use crate::task::Task;

/// Synchronous answer to a registration call.
///
/// Says what was accepted, never what was installed; outcomes arrive on the
/// reporting channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationAck {
    /// Producer scheme
    pub scheme: String,
    /// Valid resources in the call
    pub accepted: usize,
    /// Resources rejected by validation
    pub dropped: Vec<ValidationError>,
    /// Resources identical to what the scheme declared before
    pub unchanged: usize,
    /// Resources the scheme no longer declares
    pub removed: usize,
    /// Tasks queued by the call
    pub tasks_created: usize,
}

/// One candidate resource in the installation state view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateState {
    /// `scheme:id`
    pub url: String,
    /// Producer scheme
    pub scheme: String,
    /// Declared priority
    pub priority: i32,
    /// Priority after override rules
    pub effective_priority: i32,
    /// Content fingerprint
    pub digest: String,
    /// Whether this is the resource chosen for the entity
    pub active: bool,
}

/// Installation state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    /// Declared candidates, winner first
    pub candidates: Vec<CandidateState>,
    /// What the tracking store says is applied
    pub tracked: Option<TrackedEntity>,
    /// Whether a task for the entity is queued
    pub pending: bool,
    /// Whether the entity is tracked but not yet re-declared since startup
    pub unconfirmed: bool,
}

fn validate_scheme(scheme: &str) -> InstallerResult<()> {
    if scheme.trim().is_empty() {
        return Err(InstallerError::invalid_scheme(scheme, "scheme is empty"));
    }
    if scheme.contains(':') {
        return Err(InstallerError::invalid_scheme(scheme, "scheme contains ':'"));
    }
    Ok(())
}

/// The reconciling installer.
pub struct Installer {
    config: InstallerConfig,
    rules: Arc<OverrideRules>,
    registry: ResourceRegistry,
    queue: Mutex<TaskQueue>,
    store: Arc<TrackingStore>,
    reporter: Arc<Reporter>,
    executor: Executor,
    unconfirmed: Mutex<BTreeSet<String>>,
    grace_done: AtomicBool,
    started_at: Instant,
    wake: Notify,
}

impl Installer {
    /// Creates an installer over an opened tracking store.
    ///
    /// Every tracked entity starts unconfirmed: producers have until the
    /// grace period ends to declare it again.
    pub fn new(
        config: InstallerConfig,
        store: TrackingStore,
        processors: ProcessorRegistry,
    ) -> InstallerResult<Self> {
        config.validate()?;

        // Records of removed entities carry nothing worth reconciling.
        for entity_id in store.keys() {
            if store.get(&entity_id).is_some_and(|e| !e.is_installed()) {
                debug!("Pruning removed entity record {}", entity_id);
                store.remove(&entity_id)?;
            }
        }
        let unconfirmed = store.keys();
        info!(
            "Installer starting with {} tracked entities, {} kinds handled, grace period {:?}",
            unconfirmed.len(),
            processors.len(),
            config.grace_period()
        );

        let rules = Arc::new(OverrideRules::new());
        let store = Arc::new(store);
        let reporter = Arc::new(Reporter::new());
        let executor = Executor::new(
            processors,
            Arc::clone(&store),
            Arc::clone(&reporter),
            config.retry_policy(),
        );

        Ok(Self {
            registry: ResourceRegistry::new(Arc::clone(&rules)),
            rules,
            queue: Mutex::new(TaskQueue::new()),
            store,
            reporter,
            executor,
            unconfirmed: Mutex::new(unconfirmed),
            grace_done: AtomicBool::new(false),
            started_at: Instant::now(),
            wake: Notify::new(),
            config,
        })
    }

    /// Creates an installer over a file-backed store in `config.state_dir`.
    pub fn open(config: InstallerConfig, processors: ProcessorRegistry) -> InstallerResult<Self> {
        let store = TrackingStore::open(FileBackend::open(&config.state_dir)?)?;
        Self::new(config, store, processors)
    }

    /// Sets the initial override rules.
    pub fn with_rules(self, rules: Vec<OverrideRule>) -> Self {
        self.rules.replace(rules);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Returns the override rules.
    pub fn override_rules(&self) -> &Arc<OverrideRules> {
        &self.rules
    }

    /// Returns the tracking store.
    pub fn store(&self) -> &Arc<TrackingStore> {
        &self.store
    }

    /// Replaces the override rules and re-selects every entity's winner.
    pub fn replace_override_rules(&self, rules: Vec<OverrideRule>) -> usize {
        info!("Replacing override rules ({} rules)", rules.len());
        self.rules.replace(rules);
        let (created, cancelled) = self.registry.reevaluate_all(&self.queue);
        self.report_cancelled(cancelled);
        if created > 0 {
            self.wake.notify_one();
        }
        created
    }

    /// Replaces the declared resource set of `scheme`.
    pub fn register_resources(
        &self,
        scheme: &str,
        resources: Vec<InstallableResource>,
    ) -> InstallerResult<RegistrationAck> {
        validate_scheme(scheme)?;
        let outcome = self.registry.register(scheme, resources, &self.queue);
        Ok(self.acknowledge(scheme, outcome))
    }

    /// Applies a delta to the declared resource set of `scheme`.
    ///
    /// Fails with [`InstallerError::SchemeNotRegistered`] until the scheme
    /// has called [`register_resources`](Self::register_resources).
    pub fn update_resources(
        &self,
        scheme: &str,
        added: Vec<InstallableResource>,
        removed_ids: &[String],
    ) -> InstallerResult<RegistrationAck> {
        validate_scheme(scheme)?;
        let outcome = self
            .registry
            .update(scheme, added, removed_ids, &self.queue)?;
        Ok(self.acknowledge(scheme, outcome))
    }

    fn acknowledge(&self, scheme: &str, outcome: RegistrationOutcome) -> RegistrationAck {
        {
            let mut unconfirmed = self.unconfirmed.lock();
            for entity_id in &outcome.declared_entities {
                if unconfirmed.remove(entity_id) {
                    debug!("{}: confirmed by {}", entity_id, scheme);
                }
            }
        }

        self.report_cancelled(outcome.cancelled);
        if outcome.tasks_created > 0 {
            self.wake.notify_one();
        }

        RegistrationAck {
            scheme: scheme.to_string(),
            accepted: outcome.accepted,
            dropped: outcome.dropped,
            unchanged: outcome.unchanged,
            removed: outcome.removed,
            tasks_created: outcome.tasks_created,
        }
    }

    fn report_cancelled(&self, cancelled: Vec<Task>) {
        for task in cancelled {
            self.reporter
                .publish(InstallEvent::for_task(&task, TaskOutcome::Superseded));
        }
    }

    /// Schedules uninstalls for tracked entities no producer re-declared.
    ///
    /// Runs once; [`run`](Self::run) calls it when the grace period ends.
    /// Returns the number of uninstalls queued.
    pub fn reconcile_unconfirmed(&self) -> usize {
        if self.grace_done.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let unconfirmed = std::mem::take(&mut *self.unconfirmed.lock());

        let mut scheduled = 0;
        for entity_id in unconfirmed {
            let Some(tracked) = self.store.get(&entity_id) else {
                continue;
            };
            match self
                .registry
                .schedule_orphan_uninstall(&entity_id, tracked.kind, &self.queue)
            {
                Some(EnqueueEffect::Collapsed(cancelled)) => {
                    scheduled += 1;
                    self.report_cancelled(cancelled);
                }
                Some(_) => scheduled += 1,
                None => {}
            }
        }

        if scheduled > 0 {
            warn!(
                "Grace period over: {} tracked entities not re-declared, uninstalling",
                scheduled
            );
            self.wake.notify_one();
        } else {
            info!("Grace period over: every tracked entity was re-declared");
        }
        scheduled
    }

    /// Retries backed-off tasks on the next pass instead of waiting out
    /// their backoff, e.g. after something they depend on became available.
    ///
    /// Attempt counts are kept. Returns the number of tasks released.
    pub fn schedule_retry(&self) -> usize {
        let released = self.queue.lock().expedite_retries();
        if released > 0 {
            debug!("Retry scheduled for {} backed-off tasks", released);
        }
        self.wake.notify_one();
        released
    }

    /// Returns true once startup reconciliation has run.
    pub fn grace_period_over(&self) -> bool {
        self.grace_done.load(Ordering::SeqCst)
    }

    /// Runs one reconciliation pass.
    pub async fn run_pass(&self) -> PassSummary {
        self.executor.run_pass(&self.queue).await
    }

    /// Runs passes until the queue has nothing ready, or `max_passes` ran.
    pub async fn run_until_idle(&self, max_passes: usize) -> Vec<PassSummary> {
        let mut passes = Vec::new();
        while passes.len() < max_passes && self.queue.lock().has_ready(Instant::now()) {
            passes.push(self.run_pass().await);
        }
        passes
    }

    /// Background loop: runs a pass whenever work is queued, a retry backoff
    /// expires or the idle interval elapses, and triggers startup
    /// reconciliation when the grace period ends. Returns on `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Installer loop started");
        let grace_deadline = self.started_at + self.config.grace_period();

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if !self.grace_period_over() && Instant::now() >= grace_deadline {
                self.reconcile_unconfirmed();
            }

            let ready = self.queue.lock().has_ready(Instant::now());
            if ready {
                let summary = self.run_pass().await;
                let progressed = summary.succeeded + summary.failed + summary.superseded > 0;
                if progressed && self.queue.lock().has_ready(Instant::now()) {
                    continue;
                }
            }

            let now = Instant::now();
            let mut wake_at = now + self.config.idle_interval();
            if let Some(next) = self.queue.lock().next_ready_at() {
                wake_at = wake_at.min(next);
            }
            if !self.grace_period_over() {
                wake_at = wake_at.min(grace_deadline);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wake_at.saturating_duration_since(now)) => {}
            }
        }

        info!("Installer loop stopped");
    }

    /// Opens a subscription to task outcomes.
    pub fn subscribe(&self) -> UnboundedReceiver<InstallEvent> {
        self.reporter.subscribe()
    }

    /// Returns outcome counters.
    pub fn stats(&self) -> InstallerStats {
        self.reporter.stats()
    }

    /// Returns true if tasks are queued.
    pub fn has_pending_tasks(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Dumps queued tasks for debugging.
    pub fn dump_pending_tasks(&self) -> Vec<String> {
        self.queue.lock().dump()
    }

    /// Returns the registered producer schemes.
    pub fn schemes(&self) -> Vec<String> {
        self.registry.schemes()
    }

    /// Returns, per entity, its candidates, tracked record and queue status.
    ///
    /// Covers every entity that is declared, tracked or both.
    pub fn installation_state(&self) -> BTreeMap<String, EntityState> {
        let views = self.registry.entity_views();
        let pending = self.queue.lock().pending_entities();
        let unconfirmed = self.unconfirmed.lock().clone();

        let mut ids: BTreeSet<String> = views.keys().cloned().collect();
        ids.extend(self.store.keys());

        ids.into_iter()
            .map(|entity_id| {
                let candidates = views
                    .get(&entity_id)
                    .map(|view| {
                        view.candidates
                            .iter()
                            .map(|c| CandidateState {
                                url: c.url.clone(),
                                scheme: c.scheme.clone(),
                                priority: c.priority,
                                effective_priority: self.rules.effective_priority(c),
                                digest: c.digest.clone(),
                                active: view.active_url.as_deref() == Some(c.url.as_str()),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let state = EntityState {
                    candidates,
                    tracked: self.store.get(&entity_id),
                    pending: pending.contains(&entity_id),
                    unconfirmed: unconfirmed.contains(&entity_id),
                };
                (entity_id, state)
            })
            .collect()
    }
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("pending", &self.queue.lock().len())
            .finish()
    }
}

//! Execution passes over the task queue.
//!
//! A pass takes a snapshot of every ready task, runs them one at a time in
//! queue order against the processors and records each outcome in the
//! tracking store. Only one pass runs at a time, so at most one processor
//! call is ever in flight.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::processor::ProcessorRegistry;
use crate::queue::TaskQueue;
use crate::report::{InstallEvent, Reporter, TaskOutcome};
use crate::retry::RetryPolicy;
use crate::store::{TrackedEntity, TrackingStore};
use crate::task::{PersistAction, Task, TaskOperation, TaskStage};

/// Counts of what one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Tasks taken from the queue
    pub taken: usize,
    /// Tasks that reached their goal (including no-ops)
    pub succeeded: usize,
    /// Of `succeeded`, tasks that needed no processor call
    pub skipped: usize,
    /// Tasks re-queued after a transient or store failure
    pub retried: usize,
    /// Tasks given up
    pub failed: usize,
    /// Tasks dropped for newer work on the same entity
    pub superseded: usize,
    /// Tasks put back untouched behind a pending store write
    pub deferred: usize,
}

impl PassSummary {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Skipped => {
                self.succeeded += 1;
                self.skipped += 1;
            }
            o if o.is_success() => self.succeeded += 1,
            o if o.is_retryable() => self.retried += 1,
            TaskOutcome::Superseded => self.superseded += 1,
            _ => self.failed += 1,
        }
    }
}

/// What running a task led to.
enum Step {
    /// Task finished (successfully or not)
    Finished(TaskOutcome),
    /// Processor failed transiently
    Retry(String),
    /// Processor applied the change; the store write failed and may succeed later
    PersistFailed(PersistAction, String),
}

/// Runs reconciliation passes.
pub struct Executor {
    processors: ProcessorRegistry,
    store: Arc<TrackingStore>,
    reporter: Arc<Reporter>,
    policy: RetryPolicy,
    pass_lock: tokio::sync::Mutex<()>,
}

impl Executor {
    /// Creates an executor.
    pub fn new(
        processors: ProcessorRegistry,
        store: Arc<TrackingStore>,
        reporter: Arc<Reporter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            processors,
            store,
            reporter,
            policy,
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs one pass over the tasks ready now.
    ///
    /// Waits for a pass already in flight to finish first. Tasks enqueued
    /// while the pass runs are left for the next one.
    pub async fn run_pass(&self, queue: &Mutex<TaskQueue>) -> PassSummary {
        let _pass = self.pass_lock.lock().await;

        let mut pending: VecDeque<Task> = queue.lock().take_ready(Instant::now()).into();
        let mut summary = PassSummary {
            taken: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return summary;
        }
        debug!("Reconciliation pass over {} tasks", pending.len());

        // Entities whose store write is still outstanding.
        let mut held: HashSet<String> = HashSet::new();
        let mut deferred: Vec<Task> = Vec::new();

        while let Some(mut task) = pending.pop_front() {
            if held.contains(&task.entity_id) {
                summary.deferred += 1;
                deferred.push(task);
                continue;
            }

            match self.execute(&task).await {
                Step::Finished(outcome) => {
                    summary.record(&outcome);
                    self.reporter.publish(InstallEvent::for_task(&task, outcome));
                }
                Step::Retry(reason) => {
                    task.attempt += 1;
                    task.last_error = Some(reason.clone());
                    task.not_before = self.backoff_deadline(task.attempt);

                    let newer_in_pass = pending.iter().any(|t| t.entity_id == task.entity_id);
                    let outcome = if newer_in_pass {
                        TaskOutcome::Superseded
                    } else {
                        match queue.lock().requeue(task.clone()) {
                            Ok(()) => TaskOutcome::Retrying {
                                attempt: task.attempt,
                                reason,
                            },
                            Err(_) => TaskOutcome::Superseded,
                        }
                    };
                    summary.record(&outcome);
                    self.reporter.publish(InstallEvent::for_task(&task, outcome));
                }
                Step::PersistFailed(action, reason) => {
                    task.attempt += 1;
                    task.last_error = Some(reason.clone());
                    task.not_before = self.backoff_deadline(task.attempt);
                    task.stage = TaskStage::Persist(action);

                    let outcome = TaskOutcome::PersistRetry { reason };
                    summary.record(&outcome);
                    self.reporter
                        .publish(InstallEvent::for_task(&task, outcome));
                    held.insert(task.entity_id.clone());
                    deferred.push(task);
                }
            }
        }

        if !deferred.is_empty() {
            queue.lock().restore(deferred);
        }

        self.reporter.record_pass();
        info!(
            "Pass done: {} taken, {} ok ({} skipped), {} retried, {} failed, {} superseded",
            summary.taken,
            summary.succeeded,
            summary.skipped,
            summary.retried,
            summary.failed,
            summary.superseded
        );
        summary
    }

    fn backoff_deadline(&self, attempt: u32) -> Option<Instant> {
        let delay = self.policy.delay_for(attempt);
        if delay.is_zero() {
            None
        } else {
            Some(Instant::now() + delay)
        }
    }

    async fn execute(&self, task: &Task) -> Step {
        if let TaskStage::Persist(action) = &task.stage {
            return self.persist(&task.entity_id, action.clone());
        }

        if self.policy.is_exhausted(task.attempt) {
            let reason = match &task.last_error {
                Some(last) => format!("gave up after {} attempts: {}", task.attempt, last),
                None => format!("gave up after {} attempts", task.attempt),
            };
            return Step::Finished(TaskOutcome::FailedPermanent { reason });
        }

        match task.operation {
            TaskOperation::InstallOrUpdate => self.install_or_update(task).await,
            TaskOperation::Uninstall => self.uninstall(task).await,
        }
    }

    async fn install_or_update(&self, task: &Task) -> Step {
        let Some(resource) = task.resource.as_deref() else {
            return Step::Finished(TaskOutcome::FailedPermanent {
                reason: "install task carries no resource".to_string(),
            });
        };

        let prior = self.store.get(&task.entity_id);
        if prior.as_ref().is_some_and(|p| p.matches(resource)) {
            return Step::Finished(TaskOutcome::Skipped);
        }
        let prior_state = prior
            .filter(TrackedEntity::is_installed)
            .map(|p| p.processor_state);
        let was_update = prior_state.is_some();

        let processor = match self.processors.resolve(resource.kind) {
            Ok(p) => p,
            Err(e) => return Self::failed(e),
        };
        debug!(
            "{} {} via {}",
            if was_update { "Updating" } else { "Installing" },
            resource,
            processor.name()
        );

        match processor
            .install_or_update(resource, prior_state.as_ref())
            .await
        {
            Ok(state) => self.persist(
                &task.entity_id,
                PersistAction::Put {
                    entity: TrackedEntity::installed(resource, state),
                    was_update,
                },
            ),
            Err(e) => Self::failed(e),
        }
    }

    async fn uninstall(&self, task: &Task) -> Step {
        let Some(prior) = self.store.get(&task.entity_id) else {
            debug!("{} is not tracked, nothing to uninstall", task.entity_id);
            return Step::Finished(TaskOutcome::Skipped);
        };

        // The tracked kind is what was installed; the task's kind may be stale.
        let processor = match self.processors.resolve(prior.kind) {
            Ok(p) => p,
            Err(e) => return Self::failed(e),
        };
        debug!("Uninstalling {} via {}", task.entity_id, processor.name());

        match processor
            .uninstall(&task.entity_id, &prior.processor_state)
            .await
        {
            Ok(()) => self.persist(&task.entity_id, PersistAction::Remove),
            Err(e) => Self::failed(e),
        }
    }

    fn failed(error: ExecutionError) -> Step {
        if error.is_retryable() {
            Step::Retry(error.to_string())
        } else {
            Step::Finished(TaskOutcome::FailedPermanent {
                reason: error.to_string(),
            })
        }
    }

    fn persist(&self, entity_id: &str, action: PersistAction) -> Step {
        let result = match &action {
            PersistAction::Put { entity, .. } => self.store.put(entity.clone()),
            PersistAction::Remove => self.store.remove(entity_id).map(|_| ()),
        };

        match (result, action) {
            (Ok(()), PersistAction::Put { was_update: true, .. }) => {
                Step::Finished(TaskOutcome::Updated)
            }
            (Ok(()), PersistAction::Put { .. }) => Step::Finished(TaskOutcome::Installed),
            (Ok(()), PersistAction::Remove) => Step::Finished(TaskOutcome::Uninstalled),
            (Err(e), _) if !e.is_retryable() => {
                warn!("Store rejected record for {}: {}", entity_id, e);
                Step::Finished(TaskOutcome::FailedPermanent {
                    reason: format!("store rejected record: {}", e),
                })
            }
            (Err(e), action) => Step::PersistFailed(action, e.to_string()),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("processors", &self.processors)
            .field("store", &self.store)
            .field("policy", &self.policy)
            .finish()
    }
}

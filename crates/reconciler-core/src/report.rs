//! Status/reporting channel for task outcomes.
//!
//! Producers only get a synchronous acknowledgment of registration; what
//! happened to their resources is published here as [`InstallEvent`]s. Every
//! subscriber receives every event exactly once, in publication order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::task::{Task, TaskOperation};

/// Result of running (or not running) one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Entity newly installed
    Installed,
    /// Installed entity moved to a new resource or digest
    Updated,
    /// Entity removed
    Uninstalled,
    /// Runtime already matches; processor not called
    Skipped,
    /// Transient failure; task re-queued
    Retrying {
        /// Failed attempts so far
        attempt: u32,
        /// Processor message
        reason: String,
    },
    /// Processor succeeded but the store write failed; write re-queued
    PersistRetry {
        /// Store error message
        reason: String,
    },
    /// Task discarded without reaching its goal
    FailedPermanent {
        /// Why the task was given up
        reason: String,
    },
    /// Task dropped in favour of newer work for the same entity
    Superseded,
}

impl TaskOutcome {
    /// Returns true if the runtime now matches the task's intent.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TaskOutcome::Installed
                | TaskOutcome::Updated
                | TaskOutcome::Uninstalled
                | TaskOutcome::Skipped
        )
    }

    /// Returns true if the task went back into the queue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskOutcome::Retrying { .. } | TaskOutcome::PersistRetry { .. }
        )
    }

    /// Returns true if the task was given up.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::FailedPermanent { .. })
    }
}

/// One published outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallEvent {
    /// Entity the task applied to
    pub entity_id: String,
    /// Resource URL for install/update tasks
    pub resource_url: Option<String>,
    /// Task operation
    pub operation: TaskOperation,
    /// What happened
    pub outcome: TaskOutcome,
    /// Failed attempts before this event
    pub attempt: u32,
    /// When the event was published
    pub timestamp: DateTime<Utc>,
}

impl InstallEvent {
    /// Builds the event for a task.
    pub fn for_task(task: &Task, outcome: TaskOutcome) -> Self {
        Self {
            entity_id: task.entity_id.clone(),
            resource_url: task.resource_url().map(str::to_string),
            operation: task.operation,
            outcome,
            attempt: task.attempt,
            timestamp: Utc::now(),
        }
    }
}

/// Running totals of published outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerStats {
    /// Completed reconciliation passes
    pub passes: u64,
    /// Installs
    pub installed: u64,
    /// Updates
    pub updated: u64,
    /// Uninstalls
    pub uninstalled: u64,
    /// No-op tasks
    pub skipped: u64,
    /// Transient failures and store-write retries
    pub retried: u64,
    /// Permanent failures
    pub failed: u64,
    /// Tasks dropped for newer work
    pub superseded: u64,
}

impl InstallerStats {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Installed => self.installed += 1,
            TaskOutcome::Updated => self.updated += 1,
            TaskOutcome::Uninstalled => self.uninstalled += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Retrying { .. } | TaskOutcome::PersistRetry { .. } => self.retried += 1,
            TaskOutcome::FailedPermanent { .. } => self.failed += 1,
            TaskOutcome::Superseded => self.superseded += 1,
        }
    }
}

/// Fan-out publisher of [`InstallEvent`]s.
#[derive(Debug, Default)]
pub struct Reporter {
    subscribers: Mutex<Vec<UnboundedSender<InstallEvent>>>,
    stats: Mutex<InstallerStats>,
}

impl Reporter {
    /// Creates a reporter with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new subscription; it sees events published from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<InstallEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publishes an event to the log, the counters and every subscriber.
    pub fn publish(&self, event: InstallEvent) {
        let url = event.resource_url.as_deref().unwrap_or("-");
        match &event.outcome {
            TaskOutcome::Installed | TaskOutcome::Updated | TaskOutcome::Uninstalled => info!(
                "{} {}: {:?} ({})",
                event.operation, event.entity_id, event.outcome, url
            ),
            TaskOutcome::Skipped | TaskOutcome::Superseded => debug!(
                "{} {}: {:?} ({})",
                event.operation, event.entity_id, event.outcome, url
            ),
            TaskOutcome::Retrying { attempt, reason } => warn!(
                "{} {} failed (attempt {}), will retry: {}",
                event.operation, event.entity_id, attempt, reason
            ),
            TaskOutcome::PersistRetry { reason } => error!(
                "{} {} applied but not recorded, will retry store write: {}",
                event.operation, event.entity_id, reason
            ),
            TaskOutcome::FailedPermanent { reason } => error!(
                "{} {} failed permanently ({}): {}",
                event.operation, event.entity_id, url, reason
            ),
        }

        self.stats.lock().record(&event.outcome);

        // Closed receivers are dropped from the list.
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Counts a finished pass.
    pub fn record_pass(&self) {
        self.stats.lock().passes += 1;
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> InstallerStats {
        self.stats.lock().clone()
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    fn event(outcome: TaskOutcome) -> InstallEvent {
        InstallEvent::for_task(&Task::uninstall("e1", ResourceKind::Module), outcome)
    }

    #[test]
    fn test_outcome_classification() {
        assert!(TaskOutcome::Skipped.is_success());
        assert!(TaskOutcome::Uninstalled.is_success());
        assert!(!TaskOutcome::Superseded.is_success());

        assert!(TaskOutcome::Retrying {
            attempt: 1,
            reason: "x".into()
        }
        .is_retryable());
        assert!(TaskOutcome::PersistRetry { reason: "x".into() }.is_retryable());

        assert!(TaskOutcome::FailedPermanent { reason: "x".into() }.is_failure());
        assert!(!TaskOutcome::Installed.is_failure());
    }

    #[test]
    fn test_every_subscriber_sees_every_event() {
        let reporter = Reporter::new();
        let mut a = reporter.subscribe();
        let mut b = reporter.subscribe();

        reporter.publish(event(TaskOutcome::Uninstalled));
        reporter.publish(event(TaskOutcome::Skipped));

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap().outcome, TaskOutcome::Uninstalled);
            assert_eq!(rx.try_recv().unwrap().outcome, TaskOutcome::Skipped);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let reporter = Reporter::new();
        let rx = reporter.subscribe();
        let _kept = reporter.subscribe();
        drop(rx);

        reporter.publish(event(TaskOutcome::Skipped));
        assert_eq!(reporter.subscriber_count(), 1);
    }

    #[test]
    fn test_stats() {
        let reporter = Reporter::new();
        reporter.publish(event(TaskOutcome::Uninstalled));
        reporter.publish(event(TaskOutcome::FailedPermanent {
            reason: "bad".into(),
        }));
        reporter.publish(event(TaskOutcome::Retrying {
            attempt: 1,
            reason: "later".into(),
        }));
        reporter.record_pass();

        let stats = reporter.stats();
        assert_eq!(stats.uninstalled, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.passes, 1);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(event(TaskOutcome::FailedPermanent {
            reason: "bad".into(),
        }))
        .unwrap();
        assert_eq!(json["operation"], "UNINSTALL");
        assert_eq!(json["outcome"]["outcome"], "failed_permanent");
    }
}

//! Tasks: units of work produced by the registry and run by the executor.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::{RegisteredResource, ResourceKind};
use crate::store::TrackedEntity;

/// What a task does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOperation {
    /// Install the resource, or update the installed entity to it
    InstallOrUpdate,
    /// Remove the entity from the runtime
    Uninstall,
}

impl TaskOperation {
    /// Returns the operation name for logs and dumps.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOperation::InstallOrUpdate => "INSTALL_OR_UPDATE",
            TaskOperation::Uninstall => "UNINSTALL",
        }
    }
}

impl fmt::Display for TaskOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task.
///
/// `Pending → Running → {Done | Retry → Pending | FailedPermanent}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting in the queue
    Pending,
    /// Taken by the current pass
    Running,
    /// Completed and discarded
    Done,
    /// Failed transiently, waiting for its backoff before `Pending`
    Retry,
    /// Discarded after an unrecoverable failure
    FailedPermanent,
}

impl TaskState {
    /// Returns true if the task left the queue for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::FailedPermanent)
    }
}

/// Which step of a task still has to happen.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStage {
    /// Call the processor
    Dispatch,
    /// Processor already applied the change; only the store write is left
    Persist(PersistAction),
}

/// Store write left over from a task whose processor call succeeded.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistAction {
    /// Record the entity as installed or updated
    Put {
        /// Record to write
        entity: TrackedEntity,
        /// Whether a prior record existed (install vs update)
        was_update: bool,
    },
    /// Drop the entity record
    Remove,
}

/// A unit of reconciliation work.
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) seq: u64,
    /// What to do
    pub operation: TaskOperation,
    /// Entity the task applies to
    pub entity_id: String,
    /// Kind used for processor dispatch
    pub kind: ResourceKind,
    /// Resource to apply, for `InstallOrUpdate`
    pub resource: Option<Arc<RegisteredResource>>,
    /// Failed attempts so far
    pub attempt: u32,
    /// Message of the last failure
    pub last_error: Option<String>,
    /// When the registry created the task
    pub created_at: DateTime<Utc>,
    pub(crate) not_before: Option<Instant>,
    pub(crate) stage: TaskStage,
}

impl Task {
    /// Creates a task installing or updating to `resource`.
    pub fn install_or_update(resource: Arc<RegisteredResource>) -> Self {
        Self {
            seq: 0,
            operation: TaskOperation::InstallOrUpdate,
            entity_id: resource.entity_id.clone(),
            kind: resource.kind,
            resource: Some(resource),
            attempt: 0,
            last_error: None,
            created_at: Utc::now(),
            not_before: None,
            stage: TaskStage::Dispatch,
        }
    }

    /// Creates a task removing an entity.
    pub fn uninstall(entity_id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            seq: 0,
            operation: TaskOperation::Uninstall,
            entity_id: entity_id.into(),
            kind,
            resource: None,
            attempt: 0,
            last_error: None,
            created_at: Utc::now(),
            not_before: None,
            stage: TaskStage::Dispatch,
        }
    }

    /// Returns the queue sequence number (0 until enqueued).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns the URL of the resource being applied, if any.
    pub fn resource_url(&self) -> Option<&str> {
        self.resource.as_deref().map(|r| r.url.as_str())
    }

    /// Returns true if only the store write is left.
    pub fn is_persist_only(&self) -> bool {
        matches!(self.stage, TaskStage::Persist(_))
    }

    /// Returns true if the task may run at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }

    /// Returns the state of a task sitting in the queue.
    pub fn queued_state(&self) -> TaskState {
        if self.not_before.is_some() {
            TaskState::Retry
        } else {
            TaskState::Pending
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {}", self.seq, self.operation, self.entity_id)?;
        if let Some(url) = self.resource_url() {
            write!(f, " <- {}", url)?;
        }
        if self.attempt > 0 {
            write!(f, " (attempt {})", self.attempt + 1)?;
        }
        if self.is_persist_only() {
            f.write_str(" [persist]")?;
        }
        Ok(())
    }
}

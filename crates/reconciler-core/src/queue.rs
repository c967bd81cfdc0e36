//! Ordered queue of pending tasks.
//!
//! The queue is FIFO across the whole installer and collapses work on the
//! same entity as tasks arrive:
//!
//! - INSTALL then INSTALL: the pending install is retargeted to the newer
//!   resource (keeps its queue position)
//! - INSTALL then UNINSTALL: the pending install is cancelled, only the
//!   uninstall remains
//! - UNINSTALL then UNINSTALL: kept once
//! - UNINSTALL then INSTALL: both kept, in order
//!
//! Persist-only tasks are never cancelled: their processor call already
//! happened, so the store write has to land before anything newer runs.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use crate::task::{Task, TaskOperation};

/// How an enqueued task was absorbed into the queue.
#[derive(Debug)]
pub enum EnqueueEffect {
    /// Added at the back
    Appended,
    /// Replaced the resource of a pending install for the same entity
    Merged,
    /// An equivalent uninstall is already pending
    Absorbed,
    /// Pending installs for the entity were cancelled by this uninstall
    Collapsed(Vec<Task>),
}

/// FIFO task queue with per-entity collapsing.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
    next_seq: u64,
}

impl TaskQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns true if some task may run at `now`.
    pub fn has_ready(&self, now: Instant) -> bool {
        self.tasks.iter().any(|t| t.is_ready(now))
    }

    /// Returns the earliest time a backed-off task becomes ready.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.tasks.iter().filter_map(|t| t.not_before).min()
    }

    /// Returns true if a task for `entity_id` is queued.
    pub fn contains_entity(&self, entity_id: &str) -> bool {
        self.tasks.iter().any(|t| t.entity_id == entity_id)
    }

    /// Returns the ids of all entities with queued work.
    pub fn pending_entities(&self) -> HashSet<String> {
        self.tasks.iter().map(|t| t.entity_id.clone()).collect()
    }

    fn last_for_mut(&mut self, entity_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().rev().find(|t| t.entity_id == entity_id)
    }

    /// Adds a freshly created task.
    pub fn enqueue(&mut self, mut task: Task) -> EnqueueEffect {
        self.next_seq += 1;
        task.seq = self.next_seq;

        match task.operation {
            TaskOperation::InstallOrUpdate => {
                if let Some(last) = self.last_for_mut(&task.entity_id) {
                    if last.operation == TaskOperation::InstallOrUpdate && !last.is_persist_only() {
                        last.kind = task.kind;
                        last.resource = task.resource;
                        last.created_at = task.created_at;
                        last.attempt = 0;
                        last.last_error = None;
                        last.not_before = None;
                        return EnqueueEffect::Merged;
                    }
                }
                self.tasks.push_back(task);
                EnqueueEffect::Appended
            }
            TaskOperation::Uninstall => {
                let mut cancelled = Vec::new();
                let mut i = 0;
                while i < self.tasks.len() {
                    let t = &self.tasks[i];
                    if t.entity_id == task.entity_id
                        && t.operation == TaskOperation::InstallOrUpdate
                        && !t.is_persist_only()
                    {
                        if let Some(removed) = self.tasks.remove(i) {
                            cancelled.push(removed);
                        }
                    } else {
                        i += 1;
                    }
                }

                let already_pending = self
                    .last_for_mut(&task.entity_id)
                    .map_or(false, |l| l.operation == TaskOperation::Uninstall && !l.is_persist_only());
                if !already_pending {
                    self.tasks.push_back(task);
                }

                match (cancelled.is_empty(), already_pending) {
                    (true, true) => EnqueueEffect::Absorbed,
                    (true, false) => EnqueueEffect::Appended,
                    (false, _) => EnqueueEffect::Collapsed(cancelled),
                }
            }
        }
    }

    /// Puts a task that ran back into the queue.
    ///
    /// A dispatch-stage task is handed back in `Err` when newer work for the
    /// same entity arrived meanwhile; that work supersedes it. Persist-only
    /// tasks are always accepted, ahead of any newer work for the entity.
    pub fn requeue(&mut self, task: Task) -> Result<(), Task> {
        let first_same = self.tasks.iter().position(|t| t.entity_id == task.entity_id);

        if task.is_persist_only() {
            match first_same {
                Some(pos) => self.tasks.insert(pos, task),
                None => self.tasks.push_back(task),
            }
            return Ok(());
        }

        if first_same.is_some() {
            return Err(task);
        }
        self.tasks.push_back(task);
        Ok(())
    }

    /// Returns tasks taken by a pass but not run to the front of the queue.
    ///
    /// They are older than anything enqueued since, so order is kept.
    pub fn restore(&mut self, tasks: Vec<Task>) {
        for task in tasks.into_iter().rev() {
            self.tasks.push_front(task);
        }
    }

    /// Removes and returns every task that may run at `now`, in order.
    ///
    /// A task still backing off blocks the later tasks of its entity, so
    /// per-entity order survives retries.
    pub fn take_ready(&mut self, now: Instant) -> Vec<Task> {
        let mut ready = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.tasks.len());
        let mut blocked: HashSet<String> = HashSet::new();

        for task in self.tasks.drain(..) {
            if blocked.contains(&task.entity_id) || !task.is_ready(now) {
                blocked.insert(task.entity_id.clone());
                remaining.push_back(task);
            } else {
                ready.push(task);
            }
        }

        self.tasks = remaining;
        ready
    }

    /// Makes backed-off processor retries ready now, keeping their attempt
    /// counts. Pending store writes keep their backoff. Returns how many
    /// tasks were released.
    pub fn expedite_retries(&mut self) -> usize {
        let mut released = 0;
        for task in self.tasks.iter_mut() {
            if task.not_before.is_some() && !task.is_persist_only() {
                task.not_before = None;
                released += 1;
            }
        }
        released
    }

    /// Returns the queued tasks in order.
    pub fn peek(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Clears the queue.
    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// Dumps queued tasks for debugging.
    pub fn dump(&self) -> Vec<String> {
        self.tasks
            .iter()
            .map(|t| format!("{:?}: {}", t.queued_state(), t))
            .collect()
    }
}

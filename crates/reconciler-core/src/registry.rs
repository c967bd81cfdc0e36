//! Per-producer resource sets and the shared entity → candidates map.
//!
//! Each scheme owns a snapshot of what it last declared. A registration call
//! diffs the incoming resources against that snapshot, merges the changes
//! into the shared candidates map, re-runs winner selection for every touched
//! entity and turns each change of winner into a task.
//!
//! Locking: a scheme's snapshot lock is held for the whole call (a producer's
//! calls are serialized); the candidates map and the task queue are locked
//! together for the merge so tasks for one entity reach the queue in the same
//! order their winner decisions were made, whatever the producer.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{InstallerError, InstallerResult, ValidationError};
use crate::override_rules::OverrideRules;
use crate::queue::{EnqueueEffect, TaskQueue};
use crate::resource::{resource_url, InstallableResource, RegisteredResource, ResourceKind};
use crate::task::Task;

/// Last declared resource set of one producer.
#[derive(Debug, Default)]
struct SchemeSnapshot {
    resources: BTreeMap<String, Arc<RegisteredResource>>,
}

/// What the installer last decided to apply for an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveMarker {
    url: String,
    digest: String,
    kind: ResourceKind,
}

impl ActiveMarker {
    fn of(resource: &RegisteredResource) -> Self {
        Self {
            url: resource.url.clone(),
            digest: resource.digest.clone(),
            kind: resource.kind,
        }
    }
}

#[derive(Debug, Default)]
struct EntityCandidates {
    /// Keyed by resource URL
    candidates: BTreeMap<String, Arc<RegisteredResource>>,
    active: Option<ActiveMarker>,
}

/// Result of one registration call.
#[derive(Debug, Default)]
pub struct RegistrationOutcome {
    /// Valid resources in the call
    pub accepted: usize,
    /// Resources rejected by validation
    pub dropped: Vec<ValidationError>,
    /// Accepted resources identical to the previous snapshot
    pub unchanged: usize,
    /// Previously declared resources no longer declared
    pub removed: usize,
    /// Tasks handed to the queue
    pub tasks_created: usize,
    /// Queued installs cancelled by an uninstall created here
    pub cancelled: Vec<Task>,
    /// Entities the scheme declares after the call
    pub declared_entities: BTreeSet<String>,
}

/// Candidates of one entity, winner first.
#[derive(Debug, Clone)]
pub struct EntityView {
    /// Every declared resource for the entity, in selection order
    pub candidates: Vec<Arc<RegisteredResource>>,
    /// URL of the resource last chosen for installation
    pub active_url: Option<String>,
}

/// The resource registry.
#[derive(Debug)]
pub struct ResourceRegistry {
    schemes: Mutex<HashMap<String, Arc<Mutex<SchemeSnapshot>>>>,
    entities: Mutex<HashMap<String, EntityCandidates>>,
    rules: Arc<OverrideRules>,
}

fn validate_all(
    scheme: &str,
    resources: Vec<InstallableResource>,
) -> (Vec<Arc<RegisteredResource>>, Vec<ValidationError>) {
    let mut valid: BTreeMap<String, Arc<RegisteredResource>> = BTreeMap::new();
    let mut dropped = Vec::new();

    for resource in resources {
        match RegisteredResource::validate(scheme, resource) {
            Ok(r) => {
                if valid.contains_key(&r.id) {
                    warn!("{}: duplicate resource id {}, keeping the last one", scheme, r.id);
                }
                valid.insert(r.id.clone(), Arc::new(r));
            }
            Err(e) => {
                warn!("{}: dropping invalid resource: {}", scheme, e);
                dropped.push(e);
            }
        }
    }

    (valid.into_values().collect(), dropped)
}

fn unchanged(prev: &RegisteredResource, next: &RegisteredResource) -> bool {
    prev.same_content(next) && prev.priority == next.priority && prev.kind == next.kind
}

impl ResourceRegistry {
    /// Creates an empty registry using `rules` for winner selection.
    pub fn new(rules: Arc<OverrideRules>) -> Self {
        Self {
            schemes: Mutex::new(HashMap::new()),
            entities: Mutex::new(HashMap::new()),
            rules,
        }
    }

    /// Returns the override rules.
    pub fn rules(&self) -> &Arc<OverrideRules> {
        &self.rules
    }

    /// Returns true once `scheme` has registered a full set.
    pub fn is_registered(&self, scheme: &str) -> bool {
        self.schemes.lock().contains_key(scheme)
    }

    /// Returns the registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.schemes.lock().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Returns true if some producer declares a resource for `entity_id`.
    pub fn is_declared(&self, entity_id: &str) -> bool {
        self.entities.lock().contains_key(entity_id)
    }

    fn snapshot_for(&self, scheme: &str) -> Option<Arc<Mutex<SchemeSnapshot>>> {
        self.schemes.lock().get(scheme).cloned()
    }

    fn snapshot_or_create(&self, scheme: &str) -> Arc<Mutex<SchemeSnapshot>> {
        Arc::clone(self.schemes.lock().entry(scheme.to_string()).or_default())
    }

    /// Replaces the declared set of `scheme`.
    pub fn register(
        &self,
        scheme: &str,
        resources: Vec<InstallableResource>,
        queue: &Mutex<TaskQueue>,
    ) -> RegistrationOutcome {
        let (valid, dropped) = validate_all(scheme, resources);
        let snapshot = self.snapshot_or_create(scheme);
        let mut snapshot = snapshot.lock();

        let incoming: HashSet<&str> = valid.iter().map(|r| r.id.as_str()).collect();
        let removals: Vec<String> = snapshot
            .resources
            .keys()
            .filter(|id| !incoming.contains(id.as_str()))
            .cloned()
            .collect();

        let accepted = valid.len();
        let mut outcome = self.apply(scheme, &mut snapshot, valid, removals, queue);
        outcome.accepted = accepted;
        outcome.dropped = dropped;
        outcome.declared_entities = snapshot
            .resources
            .values()
            .map(|r| r.entity_id.clone())
            .collect();

        info!(
            "{}: registered {} resources ({} unchanged, {} removed, {} dropped), {} tasks",
            scheme,
            outcome.accepted,
            outcome.unchanged,
            outcome.removed,
            outcome.dropped.len(),
            outcome.tasks_created
        );
        outcome
    }

    /// Applies a delta to the declared set of `scheme`.
    ///
    /// `removed_ids` may hold plain ids or `scheme:id` URLs. An id both added
    /// and removed in the same call ends up removed.
    pub fn update(
        &self,
        scheme: &str,
        added: Vec<InstallableResource>,
        removed_ids: &[String],
        queue: &Mutex<TaskQueue>,
    ) -> InstallerResult<RegistrationOutcome> {
        let snapshot = self
            .snapshot_for(scheme)
            .ok_or_else(|| InstallerError::SchemeNotRegistered {
                scheme: scheme.to_string(),
            })?;
        let mut snapshot = snapshot.lock();

        let prefix = format!("{}:", scheme);
        let removals: BTreeSet<String> = removed_ids
            .iter()
            .map(|raw| {
                let raw = raw.trim();
                if snapshot.resources.contains_key(raw) {
                    raw.to_string()
                } else {
                    raw.strip_prefix(&prefix).unwrap_or(raw).to_string()
                }
            })
            .collect();

        let (valid, dropped) = validate_all(scheme, added);
        let accepted = valid.len();
        let upserts: Vec<Arc<RegisteredResource>> = valid
            .into_iter()
            .filter(|r| {
                let keep = !removals.contains(&r.id);
                if !keep {
                    debug!("{}: {} added and removed in one update, removing", scheme, r.url);
                }
                keep
            })
            .collect();

        let declared: BTreeSet<String> = upserts.iter().map(|r| r.entity_id.clone()).collect();
        let mut outcome = self.apply(
            scheme,
            &mut snapshot,
            upserts,
            removals.into_iter().collect(),
            queue,
        );
        outcome.accepted = accepted;
        outcome.dropped = dropped;
        outcome.declared_entities = declared;

        info!(
            "{}: update with {} added, {} removed ({} unchanged, {} dropped), {} tasks",
            scheme,
            outcome.accepted,
            outcome.removed,
            outcome.unchanged,
            outcome.dropped.len(),
            outcome.tasks_created
        );
        Ok(outcome)
    }

    fn apply(
        &self,
        scheme: &str,
        snapshot: &mut SchemeSnapshot,
        upserts: Vec<Arc<RegisteredResource>>,
        removals: Vec<String>,
        queue: &Mutex<TaskQueue>,
    ) -> RegistrationOutcome {
        let mut outcome = RegistrationOutcome::default();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        let mut entities = self.entities.lock();

        for resource in upserts {
            if let Some(prev) = snapshot.resources.get(&resource.id) {
                if unchanged(prev, &resource) {
                    outcome.unchanged += 1;
                    continue;
                }
                if prev.entity_id != resource.entity_id {
                    debug!(
                        "{}: {} moved from {} to {}",
                        scheme, resource.url, prev.entity_id, resource.entity_id
                    );
                    if let Some(state) = entities.get_mut(&prev.entity_id) {
                        state.candidates.remove(&prev.url);
                    }
                    touched.insert(prev.entity_id.clone());
                }
                debug!("{}: changed {}", scheme, resource);
            } else {
                debug!("{}: new {}", scheme, resource);
            }

            entities
                .entry(resource.entity_id.clone())
                .or_default()
                .candidates
                .insert(resource.url.clone(), Arc::clone(&resource));
            touched.insert(resource.entity_id.clone());
            snapshot.resources.insert(resource.id.clone(), resource);
        }

        for id in removals {
            let Some(prev) = snapshot.resources.remove(&id) else {
                debug!("{}: ignoring removal of unknown id {}", scheme, id);
                continue;
            };
            debug!("{}: removed {}", scheme, prev.url);
            if let Some(state) = entities.get_mut(&prev.entity_id) {
                state.candidates.remove(&prev.url);
            }
            touched.insert(prev.entity_id.clone());
            outcome.removed += 1;
        }

        let mut queue = queue.lock();
        for entity_id in touched {
            if let Some(task) = self.decide(&mut entities, &entity_id) {
                outcome.tasks_created += 1;
                if let EnqueueEffect::Collapsed(cancelled) = queue.enqueue(task) {
                    outcome.cancelled.extend(cancelled);
                }
            }
        }

        outcome
    }

    /// Re-runs winner selection for one entity and returns the task needed
    /// to move the runtime to the new winner, if any.
    fn decide(
        &self,
        entities: &mut HashMap<String, EntityCandidates>,
        entity_id: &str,
    ) -> Option<Task> {
        let state = entities.get_mut(entity_id)?;

        match self.rules.select_winner(state.candidates.values()).cloned() {
            Some(winner) => {
                let marker = ActiveMarker::of(&winner);
                if state.active.as_ref() == Some(&marker) {
                    return None;
                }
                debug!("{}: winner is now {}", entity_id, winner.url);
                state.active = Some(marker);
                Some(Task::install_or_update(winner))
            }
            None => {
                let active = state.active.take();
                entities.remove(entity_id);
                active.map(|a| {
                    debug!("{}: no candidates left, was {}", entity_id, a.url);
                    Task::uninstall(entity_id, a.kind)
                })
            }
        }
    }

    /// Re-runs winner selection for every entity, after the override rules
    /// changed. Returns the number of tasks created and the cancelled ones.
    pub fn reevaluate_all(&self, queue: &Mutex<TaskQueue>) -> (usize, Vec<Task>) {
        let mut entities = self.entities.lock();
        let mut queue = queue.lock();
        let ids: Vec<String> = entities.keys().cloned().collect();

        let mut created = 0;
        let mut cancelled = Vec::new();
        for entity_id in ids {
            if let Some(task) = self.decide(&mut entities, &entity_id) {
                created += 1;
                if let EnqueueEffect::Collapsed(c) = queue.enqueue(task) {
                    cancelled.extend(c);
                }
            }
        }
        (created, cancelled)
    }

    /// Queues an uninstall for a tracked entity no producer declares.
    ///
    /// Returns `None` without queuing anything if the entity is declared by
    /// the time the candidates lock is taken.
    pub fn schedule_orphan_uninstall(
        &self,
        entity_id: &str,
        kind: ResourceKind,
        queue: &Mutex<TaskQueue>,
    ) -> Option<EnqueueEffect> {
        let entities = self.entities.lock();
        if entities.contains_key(entity_id) {
            return None;
        }
        info!("{}: not declared by any producer, scheduling uninstall", entity_id);
        let effect = queue.lock().enqueue(Task::uninstall(entity_id, kind));
        Some(effect)
    }

    /// Returns the candidates of every declared entity.
    pub fn entity_views(&self) -> BTreeMap<String, EntityView> {
        let entities = self.entities.lock();
        entities
            .iter()
            .map(|(id, state)| {
                let mut candidates: Vec<Arc<RegisteredResource>> =
                    state.candidates.values().cloned().collect();
                self.rules.sort(&mut candidates);
                (
                    id.clone(),
                    EntityView {
                        candidates,
                        active_url: state.active.as_ref().map(|a| a.url.clone()),
                    },
                )
            })
            .collect()
    }

    /// Returns the URLs `scheme` currently declares.
    pub fn declared_urls(&self, scheme: &str) -> Vec<String> {
        self.snapshot_for(scheme)
            .map(|s| {
                s.lock()
                    .resources
                    .keys()
                    .map(|id| resource_url(scheme, id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

//! Verification utilities for installer state
//!
//! Helpers that check the tracking store and the published outcome stream
//! against expected values, returning descriptive errors.

use reconciler_core::{InstallEvent, TaskOperation, TaskOutcome, TrackedEntity, TrackingStore};
use thiserror::Error;

/// Verification errors
#[derive(Debug, Error)]
pub enum VerificationError {
    /// Entity has no installed record
    #[error("Entity not tracked as installed: {entity_id}")]
    NotTracked { entity_id: String },

    /// Entity still has an installed record
    #[error("Entity unexpectedly tracked: {entity_id} (active {active})")]
    UnexpectedlyTracked { entity_id: String, active: String },

    /// Recorded digest differs
    #[error("Digest mismatch for {entity_id}: expected {expected}, got {actual}")]
    DigestMismatch {
        entity_id: String,
        expected: String,
        actual: String,
    },

    /// Recorded active resource differs
    #[error("Active resource mismatch for {entity_id}: expected {expected}, got {actual}")]
    ActiveMismatch {
        entity_id: String,
        expected: String,
        actual: String,
    },

    /// Wrong number of matching events
    #[error("Expected {expected} '{what}' events for {entity_id}, got {actual}: {seen:?}")]
    EventCount {
        entity_id: String,
        what: String,
        expected: usize,
        actual: usize,
        seen: Vec<TaskOutcome>,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Checks the tracking store.
pub struct StoreVerifier<'a> {
    store: &'a TrackingStore,
}

impl<'a> StoreVerifier<'a> {
    /// Create a new verifier over `store`
    pub fn new(store: &'a TrackingStore) -> Self {
        Self { store }
    }

    /// Assert that the entity is installed with the given digest
    pub fn assert_installed(&self, entity_id: &str, digest: &str) -> VerifyResult<TrackedEntity> {
        let record = self
            .store
            .get(entity_id)
            .filter(TrackedEntity::is_installed)
            .ok_or_else(|| VerificationError::NotTracked {
                entity_id: entity_id.to_string(),
            })?;

        if record.digest != digest {
            return Err(VerificationError::DigestMismatch {
                entity_id: entity_id.to_string(),
                expected: digest.to_string(),
                actual: record.digest,
            });
        }
        Ok(record)
    }

    /// Assert that the entity's active resource is `url`
    pub fn assert_active(&self, entity_id: &str, url: &str) -> VerifyResult<()> {
        let record = self
            .store
            .get(entity_id)
            .filter(TrackedEntity::is_installed)
            .ok_or_else(|| VerificationError::NotTracked {
                entity_id: entity_id.to_string(),
            })?;

        if record.active_resource_id != url {
            return Err(VerificationError::ActiveMismatch {
                entity_id: entity_id.to_string(),
                expected: url.to_string(),
                actual: record.active_resource_id,
            });
        }
        Ok(())
    }

    /// Assert that the entity is not installed
    pub fn assert_absent(&self, entity_id: &str) -> VerifyResult<()> {
        match self.store.get(entity_id).filter(TrackedEntity::is_installed) {
            Some(record) => Err(VerificationError::UnexpectedlyTracked {
                entity_id: entity_id.to_string(),
                active: record.active_resource_id,
            }),
            None => Ok(()),
        }
    }
}

/// Outcomes collected from a subscription.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<InstallEvent>,
}

impl EventLog {
    /// Wraps collected events
    pub fn new(events: Vec<InstallEvent>) -> Self {
        Self { events }
    }

    /// All events in publication order
    pub fn events(&self) -> &[InstallEvent] {
        &self.events
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True if nothing was published
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Outcomes published for one entity, in order
    pub fn outcomes_for(&self, entity_id: &str) -> Vec<TaskOutcome> {
        self.for_entity(entity_id).map(|e| e.outcome.clone()).collect()
    }

    /// Events published for one entity, in order
    pub fn for_entity<'a>(&'a self, entity_id: &'a str) -> impl Iterator<Item = &'a InstallEvent> {
        self.events.iter().filter(move |e| e.entity_id == entity_id)
    }

    /// Number of events for `entity_id` matching `pred`
    pub fn count(&self, entity_id: &str, pred: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.for_entity(entity_id).filter(|e| pred(&e.outcome)).count()
    }

    /// Number of uninstall events for `entity_id`
    pub fn uninstall_count(&self, entity_id: &str) -> usize {
        self.for_entity(entity_id)
            .filter(|e| e.operation == TaskOperation::Uninstall)
            .count()
    }

    /// Assert exactly `expected` events for `entity_id` match `pred`
    pub fn assert_count(
        &self,
        entity_id: &str,
        what: &str,
        expected: usize,
        pred: impl Fn(&TaskOutcome) -> bool,
    ) -> VerifyResult<()> {
        let actual = self.count(entity_id, pred);
        if actual != expected {
            return Err(VerificationError::EventCount {
                entity_id: entity_id.to_string(),
                what: what.to_string(),
                expected,
                actual,
                seen: self.outcomes_for(entity_id),
            });
        }
        Ok(())
    }

    /// Assert exactly one terminal failure for `entity_id`
    pub fn assert_failed_once(&self, entity_id: &str) -> VerifyResult<()> {
        self.assert_count(entity_id, "failed", 1, TaskOutcome::is_failure)
    }

    /// Assert no event for `entity_id` at all
    pub fn assert_silent(&self, entity_id: &str) -> VerifyResult<()> {
        self.assert_count(entity_id, "any", 0, |_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::module_fixtures;
    use reconciler_core::{ProcessorState, RegisteredResource};

    #[test]
    fn test_store_verifier() {
        let store = TrackingStore::in_memory();
        let resource =
            RegisteredResource::validate("fs", module_fixtures::module("a.jar", "e1", "d1", 5))
                .unwrap();
        store
            .put(TrackedEntity::installed(&resource, ProcessorState::new()))
            .unwrap();

        let verifier = StoreVerifier::new(&store);
        assert!(verifier.assert_installed("e1", "d1").is_ok());
        assert!(verifier.assert_active("e1", "fs:a.jar").is_ok());
        assert!(matches!(
            verifier.assert_installed("e1", "d2"),
            Err(VerificationError::DigestMismatch { .. })
        ));
        assert!(verifier.assert_absent("e1").is_err());
        assert!(verifier.assert_absent("e2").is_ok());
    }

    #[test]
    fn test_event_count_error_lists_outcomes() {
        let log = EventLog::default();
        let err = log.assert_failed_once("e1").unwrap_err();
        assert!(err.to_string().contains("Expected 1 'failed' events for e1, got 0"));
        assert!(log.assert_silent("e1").is_ok());
    }
}

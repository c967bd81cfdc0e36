//! Winner selection among resources that target the same entity.
//!
//! Candidates are ordered by effective priority (descending), then scheme
//! name (ascending), then resource id (ascending). The first candidate in
//! that order is the active one. Rules can raise or lower the effective
//! priority of a scheme, optionally only for entity ids with a given prefix;
//! the rule list can be swapped at runtime.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::resource::RegisteredResource;

/// Priority override for one producer scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRule {
    /// Scheme the rule applies to
    pub scheme: String,
    /// Restrict the rule to entity ids with this prefix
    #[serde(default)]
    pub entity_prefix: Option<String>,
    /// Effective priority for matching resources
    pub priority: i32,
}

impl OverrideRule {
    /// Creates a rule applying to every entity of a scheme.
    pub fn new(scheme: impl Into<String>, priority: i32) -> Self {
        Self {
            scheme: scheme.into(),
            entity_prefix: None,
            priority,
        }
    }

    /// Restricts the rule to entity ids starting with `prefix`.
    pub fn for_entities(mut self, prefix: impl Into<String>) -> Self {
        self.entity_prefix = Some(prefix.into());
        self
    }

    /// Returns true if the rule applies to `resource`.
    pub fn matches(&self, resource: &RegisteredResource) -> bool {
        resource.scheme == self.scheme
            && self
                .entity_prefix
                .as_deref()
                .map_or(true, |p| resource.entity_id.starts_with(p))
    }
}

fn effective_priority(rules: &[OverrideRule], resource: &RegisteredResource) -> i32 {
    rules
        .iter()
        .find(|r| r.matches(resource))
        .map_or(resource.priority, |r| r.priority)
}

fn compare_with(rules: &[OverrideRule], a: &RegisteredResource, b: &RegisteredResource) -> Ordering {
    effective_priority(rules, b)
        .cmp(&effective_priority(rules, a))
        .then_with(|| a.scheme.cmp(&b.scheme))
        .then_with(|| a.id.cmp(&b.id))
}

/// Hot-swappable override rule set.
#[derive(Debug, Default)]
pub struct OverrideRules {
    rules: RwLock<Arc<Vec<OverrideRule>>>,
}

impl OverrideRules {
    /// Creates an empty rule set (declared priorities only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a rule set from a list; the first matching rule wins.
    pub fn with_rules(rules: Vec<OverrideRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Replaces the rule list.
    ///
    /// Takes effect on the next winner selection; decisions already turned
    /// into tasks are not revisited.
    pub fn replace(&self, rules: Vec<OverrideRule>) {
        *self.rules.write() = Arc::new(rules);
    }

    /// Returns the current rule list.
    pub fn rules(&self) -> Arc<Vec<OverrideRule>> {
        Arc::clone(&self.rules.read())
    }

    /// Returns the priority used for ordering `resource`.
    pub fn effective_priority(&self, resource: &RegisteredResource) -> i32 {
        effective_priority(&self.rules(), resource)
    }

    /// Orders two candidates; `Less` means `a` wins.
    pub fn compare(&self, a: &RegisteredResource, b: &RegisteredResource) -> Ordering {
        compare_with(&self.rules(), a, b)
    }

    /// Picks the winner among candidates for one entity.
    pub fn select_winner<'a, I>(&self, candidates: I) -> Option<&'a Arc<RegisteredResource>>
    where
        I: IntoIterator<Item = &'a Arc<RegisteredResource>>,
    {
        let rules = self.rules();
        candidates
            .into_iter()
            .min_by(|a, b| compare_with(&rules, a, b))
    }

    /// Sorts candidates so the winner comes first.
    pub fn sort(&self, candidates: &mut [Arc<RegisteredResource>]) {
        let rules = self.rules();
        candidates.sort_by(|a, b| compare_with(&rules, a, b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::InstallableResource;

    fn candidate(scheme: &str, id: &str, priority: i32) -> Arc<RegisteredResource> {
        Arc::new(
            RegisteredResource::validate(
                scheme,
                InstallableResource::module(id, "org.example.e1")
                    .with_priority(priority)
                    .with_digest(format!("{}-{}", scheme, id)),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_highest_priority_wins() {
        let rules = OverrideRules::new();
        let low = candidate("fs", "a", 5);
        let high = candidate("repo", "b", 10);

        let candidates = vec![low, Arc::clone(&high)];
        let winner = rules.select_winner(&candidates).unwrap();
        assert_eq!(winner.url, high.url);
    }

    #[test]
    fn test_tie_broken_by_scheme_name() {
        let rules = OverrideRules::new();
        let candidates = vec![candidate("zeta", "a", 7), candidate("alpha", "a", 7)];

        assert_eq!(rules.select_winner(&candidates).unwrap().scheme, "alpha");
    }

    #[test]
    fn test_tie_within_scheme_broken_by_id() {
        let rules = OverrideRules::new();
        let candidates = vec![candidate("fs", "b", 7), candidate("fs", "a", 7)];

        assert_eq!(rules.select_winner(&candidates).unwrap().id, "a");
    }

    #[test]
    fn test_rule_overrides_declared_priority() {
        let rules = OverrideRules::with_rules(vec![OverrideRule::new("console", 1000)]);
        let candidates = vec![candidate("fs", "a", 500), candidate("console", "c", 1)];

        assert_eq!(rules.select_winner(&candidates).unwrap().scheme, "console");
        assert_eq!(rules.effective_priority(&candidates[1]), 1000);
    }

    #[test]
    fn test_prefix_rule_only_applies_to_matching_entities() {
        let rule = OverrideRule::new("console", 1000).for_entities("com.other.");
        let rules = OverrideRules::with_rules(vec![rule]);
        let c = candidate("console", "c", 1);

        assert_eq!(rules.effective_priority(&c), 1);
    }

    #[test]
    fn test_hot_swap() {
        let rules = OverrideRules::new();
        let candidates = vec![candidate("fs", "a", 5), candidate("repo", "b", 1)];
        assert_eq!(rules.select_winner(&candidates).unwrap().scheme, "fs");

        rules.replace(vec![OverrideRule::new("repo", 50)]);
        assert_eq!(rules.select_winner(&candidates).unwrap().scheme, "repo");
        assert_eq!(rules.rules().len(), 1);
    }

    #[test]
    fn test_sort_puts_winner_first() {
        let rules = OverrideRules::new();
        let mut candidates = vec![
            candidate("b", "x", 1),
            candidate("a", "x", 1),
            candidate("c", "x", 9),
        ];
        rules.sort(&mut candidates);

        let order: Vec<&str> = candidates.iter().map(|c| c.scheme.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_empty_candidates() {
        let rules = OverrideRules::new();
        let none: Vec<Arc<RegisteredResource>> = vec![];
        assert!(rules.select_winner(&none).is_none());
    }
}

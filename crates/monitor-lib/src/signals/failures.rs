//! Consecutive backend failure counts per rule

use super::RuleId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Per-rule consecutive failure counter
///
/// A failed evaluation increments the rule's count; any successful
/// evaluation of that rule, for any profile, clears it.
#[derive(Debug, Default)]
pub struct FailureTracker {
    counts: Mutex<HashMap<RuleId, u32>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<RuleId, u32>> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the new consecutive count
    pub fn record_failure(&self, rule: RuleId) -> u32 {
        let mut counts = self.counts();
        let count = counts.entry(rule).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn record_success(&self, rule: RuleId) {
        self.counts().remove(&rule);
    }

    pub fn count(&self, rule: RuleId) -> u32 {
        self.counts().get(&rule).copied().unwrap_or(0)
    }

    /// Rules whose count is at least `threshold`, in rule order
    pub fn at_or_above(&self, threshold: u32) -> Vec<(RuleId, u32)> {
        let mut failing: Vec<(RuleId, u32)> = self
            .counts()
            .iter()
            .filter(|(_, &n)| n >= threshold)
            .map(|(&r, &n)| (r, n))
            .collect();
        failing.sort();
        failing
    }
}

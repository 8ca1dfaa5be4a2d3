//! Anomaly signal rules and their periodic evaluator
//!
//! Each rule is its own type behind the [`SignalRule`] trait; the evaluator
//! walks them in order for every active profile, deduplicates firings, and
//! persists what fires. Consecutive backend failures per rule are tracked by
//! [`FailureTracker`] and surface through the `query_failure` meta-rule.

mod evaluator;
mod evidence;
mod failures;
mod rules;


pub use self::evaluator::{
    SignalCycleReport, SignalEvaluator, SignalEvaluatorConfig, PROFILE_DISCOVERY_QUERY,
};
pub use self::evidence::{
    ApiErrorBurstEvidence, CacheEfficiencyEvidence, CostSpikeEvidence,
    DataCollectionStoppedEvidence, Evidence, EvidenceError, QueryFailureEvidence, RuleFailure,
};
pub use self::failures::FailureTracker;
pub use self::rules::{
    default_rules, ApiErrorBurstRule, CacheEfficiencyDropRule, CostSpikeRule,
    DataCollectionStoppedRule, QueryFailureRule, RuleContext, RuleOutcome, SignalRule,
    DEFAULT_FAILURE_THRESHOLD,
};

use crate::models::UnknownVariant;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a built-in rule, as stored in `signal_events.rule_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    QueryFailure,
    CostSpike,
    ApiErrorBurst,
    DataCollectionStopped,
    CacheEfficiencyDrop,
}

impl RuleId {
    pub const ALL: [RuleId; 5] = [
        RuleId::QueryFailure,
        RuleId::CostSpike,
        RuleId::ApiErrorBurst,
        RuleId::DataCollectionStopped,
        RuleId::CacheEfficiencyDrop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::QueryFailure => "query_failure",
            RuleId::CostSpike => "cost_spike",
            RuleId::ApiErrorBurst => "api_error_burst",
            RuleId::DataCollectionStopped => "data_collection_stopped",
            RuleId::CacheEfficiencyDrop => "cache_efficiency_drop",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleId {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleId::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("signal rule", s))
    }
}

//! Typed evidence recorded with each signal event

use super::RuleId;
use crate::models::{SignalEvent, UnknownVariant};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error(transparent)]
    UnknownRule(#[from] UnknownVariant),

    #[error("malformed evidence: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleFailure {
    pub rule_id: RuleId,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFailureEvidence {
    pub failing_rules: Vec<RuleFailure>,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSpikeEvidence {
    pub current_cost: f64,
    /// Absent when the current cost never cleared the floor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_max: Option<f64>,
    /// `None` when there is no positive historical baseline
    #[serde(default)]
    pub ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBurstEvidence {
    pub server_errors: f64,
    pub rate_limit_errors: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCollectionStoppedEvidence {
    pub down_instances: usize,
    #[serde(default)]
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEfficiencyEvidence {
    pub cache_read: f64,
    pub total_tokens: f64,
    /// `None` when there was no traffic in the window
    pub ratio: Option<f64>,
}

/// Evidence of one rule evaluation
///
/// Stored as the bare per-rule object; the row's rule id says which variant
/// to decode it as.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Evidence {
    QueryFailure(QueryFailureEvidence),
    CostSpike(CostSpikeEvidence),
    ApiErrorBurst(ApiErrorBurstEvidence),
    DataCollectionStopped(DataCollectionStoppedEvidence),
    CacheEfficiency(CacheEfficiencyEvidence),
}

impl Evidence {
    pub fn rule_id(&self) -> RuleId {
        match self {
            Evidence::QueryFailure(_) => RuleId::QueryFailure,
            Evidence::CostSpike(_) => RuleId::CostSpike,
            Evidence::ApiErrorBurst(_) => RuleId::ApiErrorBurst,
            Evidence::DataCollectionStopped(_) => RuleId::DataCollectionStopped,
            Evidence::CacheEfficiency(_) => RuleId::CacheEfficiencyDrop,
        }
    }

    /// JSON for the `data` column
    pub fn to_json(&self) -> Result<String, EvidenceError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(rule_id: RuleId, data: &str) -> Result<Self, EvidenceError> {
        Ok(match rule_id {
            RuleId::QueryFailure => Evidence::QueryFailure(serde_json::from_str(data)?),
            RuleId::CostSpike => Evidence::CostSpike(serde_json::from_str(data)?),
            RuleId::ApiErrorBurst => Evidence::ApiErrorBurst(serde_json::from_str(data)?),
            RuleId::DataCollectionStopped => {
                Evidence::DataCollectionStopped(serde_json::from_str(data)?)
            }
            RuleId::CacheEfficiencyDrop => Evidence::CacheEfficiency(serde_json::from_str(data)?),
        })
    }
}

impl SignalEvent {
    /// Typed view of `data`
    pub fn evidence(&self) -> Result<Evidence, EvidenceError> {
        Evidence::decode(self.rule_id.parse()?, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_serialized_without_tag_in_camel_case() {
        let evidence = Evidence::CostSpike(CostSpikeEvidence {
            current_cost: 9.0,
            historical_max: Some(2.5),
            ratio: Some(3.6),
        });
        assert_eq!(
            evidence.to_json().unwrap(),
            r#"{"currentCost":9.0,"historicalMax":2.5,"ratio":3.6}"#
        );

        let idle = Evidence::CacheEfficiency(CacheEfficiencyEvidence {
            cache_read: 0.0,
            total_tokens: 0.0,
            ratio: None,
        });
        assert_eq!(
            idle.to_json().unwrap(),
            r#"{"cacheRead":0.0,"totalTokens":0.0,"ratio":null}"#
        );
    }

    #[test]
    fn test_event_decodes_by_rule_id() {
        let event = SignalEvent {
            id: 1,
            rule_id: "data_collection_stopped".into(),
            profile: "all".into(),
            fired_at: Utc::now(),
            data: r#"{"downInstances":2,"instances":["a:1","b:1"]}"#.into(),
            acknowledged: false,
        };

        match event.evidence().unwrap() {
            Evidence::DataCollectionStopped(e) => {
                assert_eq!(e.down_instances, 2);
                assert_eq!(e.instances, vec!["a:1", "b:1"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_decode_errors() {
        let mut event = SignalEvent {
            id: 1,
            rule_id: "budget_exceeded".into(),
            profile: "all".into(),
            fired_at: Utc::now(),
            data: "{}".into(),
            acknowledged: false,
        };
        assert!(matches!(event.evidence(), Err(EvidenceError::UnknownRule(_))));

        event.rule_id = "api_error_burst".into();
        assert!(matches!(event.evidence(), Err(EvidenceError::Json(_))));
    }

    #[test]
    fn test_query_failure_evidence_shape() {
        let evidence = Evidence::QueryFailure(QueryFailureEvidence {
            failing_rules: vec![RuleFailure {
                rule_id: RuleId::ApiErrorBurst,
                consecutive_failures: 4,
            }],
            threshold: 3,
        });
        assert_eq!(
            evidence.to_json().unwrap(),
            r#"{"failingRules":[{"ruleId":"api_error_burst","consecutiveFailures":4}],"threshold":3}"#
        );
        assert_eq!(evidence.rule_id(), RuleId::QueryFailure);
    }
}

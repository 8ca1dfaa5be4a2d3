//! Built-in signal rules

use super::evidence::{
    ApiErrorBurstEvidence, CacheEfficiencyEvidence, CostSpikeEvidence,
    DataCollectionStoppedEvidence, Evidence, QueryFailureEvidence, RuleFailure,
};
use super::{FailureTracker, RuleId};
use crate::backend::{
    log_stream_selector, profile_selector, BackendError, LogBackend, MetricsBackend,
};
use crate::models::Severity;
use async_trait::async_trait;
use std::sync::Arc;

/// Consecutive failures at which `query_failure` fires
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Service label the assistant's logs carry
const LOG_SERVICE: &str = "claude-code";

/// Backends and shared state available to every rule
#[derive(Clone)]
pub struct RuleContext {
    pub metrics: Arc<dyn MetricsBackend>,
    pub logs: Arc<dyn LogBackend>,
    pub failures: Arc<FailureTracker>,
}

/// Result of evaluating a rule for one profile
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub fired: bool,
    pub evidence: Evidence,
}

impl RuleOutcome {
    fn new(fired: bool, evidence: Evidence) -> Self {
        Self { fired, evidence }
    }
}

/// One anomaly rule
#[async_trait]
pub trait SignalRule: Send + Sync {
    fn id(&self) -> RuleId;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn severity(&self) -> Severity;

    /// Profile-agnostic rules run once per cycle under "all"
    fn profile_scoped(&self) -> bool {
        true
    }

    async fn evaluate(&self, ctx: &RuleContext, profile: &str)
        -> Result<RuleOutcome, BackendError>;
}

/// Fires when any rule has failed `threshold` times in a row
#[derive(Debug, Clone)]
pub struct QueryFailureRule {
    pub threshold: u32,
}

impl Default for QueryFailureRule {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

#[async_trait]
impl SignalRule for QueryFailureRule {
    fn id(&self) -> RuleId {
        RuleId::QueryFailure
    }

    fn name(&self) -> &'static str {
        "Backend query failures"
    }

    fn description(&self) -> &'static str {
        "A signal rule has failed to query its backend several cycles in a row"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn profile_scoped(&self) -> bool {
        false
    }

    async fn evaluate(
        &self,
        ctx: &RuleContext,
        _profile: &str,
    ) -> Result<RuleOutcome, BackendError> {
        let failing_rules: Vec<RuleFailure> = ctx
            .failures
            .at_or_above(self.threshold)
            .into_iter()
            .map(|(rule_id, consecutive_failures)| RuleFailure {
                rule_id,
                consecutive_failures,
            })
            .collect();

        Ok(RuleOutcome::new(
            !failing_rules.is_empty(),
            Evidence::QueryFailure(QueryFailureEvidence {
                failing_rules,
                threshold: self.threshold,
            }),
        ))
    }
}

/// Fires when the last hour's spend clears a floor and is several times the
/// largest hourly spend of the past week
#[derive(Debug, Clone)]
pub struct CostSpikeRule {
    pub floor_usd: f64,
    pub multiplier: f64,
}

impl Default for CostSpikeRule {
    fn default() -> Self {
        Self {
            floor_usd: 2.0,
            multiplier: 3.0,
        }
    }
}

impl CostSpikeRule {
    pub fn current_query(profile: &str) -> String {
        format!(
            "sum(increase(claude_code_cost_usage_USD_total{}[1h]))",
            profile_selector(profile)
        )
    }

    pub fn historical_query(profile: &str) -> String {
        format!(
            "max_over_time(sum(increase(claude_code_cost_usage_USD_total{}[1h]))[7d:1h])",
            profile_selector(profile)
        )
    }
}

#[async_trait]
impl SignalRule for CostSpikeRule {
    fn id(&self) -> RuleId {
        RuleId::CostSpike
    }

    fn name(&self) -> &'static str {
        "Cost spike"
    }

    fn description(&self) -> &'static str {
        "Current 1h cost exceeds $2 and is more than 3x the largest hourly cost of the past 7 days"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    async fn evaluate(&self, ctx: &RuleContext, profile: &str) -> Result<RuleOutcome, BackendError> {
        let current_cost = ctx
            .metrics
            .query(&Self::current_query(profile))
            .await?
            .scalar()?;

        if current_cost <= self.floor_usd {
            return Ok(RuleOutcome::new(
                false,
                Evidence::CostSpike(CostSpikeEvidence {
                    current_cost,
                    historical_max: None,
                    ratio: None,
                }),
            ));
        }

        let historical_max = ctx
            .metrics
            .query(&Self::historical_query(profile))
            .await?
            .scalar()?;

        let fired = historical_max > 0.0 && current_cost > historical_max * self.multiplier;
        let ratio = (historical_max > 0.0).then(|| current_cost / historical_max);

        Ok(RuleOutcome::new(
            fired,
            Evidence::CostSpike(CostSpikeEvidence {
                current_cost,
                historical_max: Some(historical_max),
                ratio,
            }),
        ))
    }
}

/// Fires on a burst of server errors or rate-limit responses in the logs
#[derive(Debug, Clone)]
pub struct ApiErrorBurstRule {
    pub server_error_threshold: f64,
    pub rate_limit_threshold: f64,
}

impl Default for ApiErrorBurstRule {
    fn default() -> Self {
        Self {
            server_error_threshold: 5.0,
            rate_limit_threshold: 20.0,
        }
    }
}

impl ApiErrorBurstRule {
    pub fn server_error_query(profile: &str) -> String {
        format!(
            "sum(count_over_time({} | http_status_code >= 500 [5m]))",
            log_stream_selector(LOG_SERVICE, profile)
        )
    }

    pub fn rate_limit_query(profile: &str) -> String {
        format!(
            "sum(count_over_time({} | http_status_code = \"429\" [5m]))",
            log_stream_selector(LOG_SERVICE, profile)
        )
    }
}

#[async_trait]
impl SignalRule for ApiErrorBurstRule {
    fn id(&self) -> RuleId {
        RuleId::ApiErrorBurst
    }

    fn name(&self) -> &'static str {
        "API error burst"
    }

    fn description(&self) -> &'static str {
        "5+ server errors (HTTP >= 500) or 20+ rate limit errors (HTTP 429) in the last 5 minutes"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    async fn evaluate(&self, ctx: &RuleContext, profile: &str) -> Result<RuleOutcome, BackendError> {
        let server_errors = ctx
            .logs
            .query(&Self::server_error_query(profile), 1)
            .await?
            .total();
        let rate_limit_errors = ctx
            .logs
            .query(&Self::rate_limit_query(profile), 1)
            .await?
            .total();

        let fired = server_errors >= self.server_error_threshold
            || rate_limit_errors >= self.rate_limit_threshold;

        Ok(RuleOutcome::new(
            fired,
            Evidence::ApiErrorBurst(ApiErrorBurstEvidence {
                server_errors,
                rate_limit_errors,
            }),
        ))
    }
}

/// Fires when the telemetry collector reports itself down
#[derive(Debug, Clone, Default)]
pub struct DataCollectionStoppedRule;

impl DataCollectionStoppedRule {
    pub const QUERY: &'static str = r#"up{job="otel-collector"} == 0"#;
}

#[async_trait]
impl SignalRule for DataCollectionStoppedRule {
    fn id(&self) -> RuleId {
        RuleId::DataCollectionStopped
    }

    fn name(&self) -> &'static str {
        "Data collection stopped"
    }

    fn description(&self) -> &'static str {
        "The OTel collector is reporting as down (up{job='otel-collector'} == 0)"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn profile_scoped(&self) -> bool {
        false
    }

    async fn evaluate(
        &self,
        ctx: &RuleContext,
        _profile: &str,
    ) -> Result<RuleOutcome, BackendError> {
        let down = ctx.metrics.query(Self::QUERY).await?;
        let down_instances = down.len();

        Ok(RuleOutcome::new(
            down_instances > 0,
            Evidence::DataCollectionStopped(DataCollectionStoppedEvidence {
                down_instances,
                instances: down.label_values("instance"),
            }),
        ))
    }
}

/// Fires when the share of cache-read tokens drops below a floor
#[derive(Debug, Clone)]
pub struct CacheEfficiencyDropRule {
    pub min_ratio: f64,
}

impl Default for CacheEfficiencyDropRule {
    fn default() -> Self {
        Self { min_ratio: 0.3 }
    }
}

impl CacheEfficiencyDropRule {
    pub fn cache_read_query(profile: &str) -> String {
        format!(
            "sum(increase(claude_code_cache_read_input_tokens_total{}[15m]))",
            profile_selector(profile)
        )
    }

    pub fn total_tokens_query(profile: &str) -> String {
        format!(
            "sum(increase(claude_code_token_usage_tokens_total{}[15m]))",
            profile_selector(profile)
        )
    }
}

#[async_trait]
impl SignalRule for CacheEfficiencyDropRule {
    fn id(&self) -> RuleId {
        RuleId::CacheEfficiencyDrop
    }

    fn name(&self) -> &'static str {
        "Cache efficiency drop"
    }

    fn description(&self) -> &'static str {
        "Cache hit ratio has been below 0.3 for the past 15 minutes"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    async fn evaluate(&self, ctx: &RuleContext, profile: &str) -> Result<RuleOutcome, BackendError> {
        let cache_read = ctx
            .metrics
            .query(&Self::cache_read_query(profile))
            .await?
            .scalar()?;
        let total_tokens = ctx
            .metrics
            .query(&Self::total_tokens_query(profile))
            .await?
            .scalar()?;

        // No traffic is not a cache problem
        if total_tokens == 0.0 {
            return Ok(RuleOutcome::new(
                false,
                Evidence::CacheEfficiency(CacheEfficiencyEvidence {
                    cache_read,
                    total_tokens,
                    ratio: None,
                }),
            ));
        }

        let ratio = cache_read / total_tokens;
        Ok(RuleOutcome::new(
            ratio < self.min_ratio,
            Evidence::CacheEfficiency(CacheEfficiencyEvidence {
                cache_read,
                total_tokens,
                ratio: Some(ratio),
            }),
        ))
    }
}

/// The built-in rules in evaluation order
pub fn default_rules() -> Vec<Box<dyn SignalRule>> {
    vec![
        Box::new(QueryFailureRule::default()),
        Box::new(CostSpikeRule::default()),
        Box::new(ApiErrorBurstRule::default()),
        Box::new(DataCollectionStoppedRule),
        Box::new(CacheEfficiencyDropRule::default()),
    ]
}

//! Component health tracking for the monitor
//!
//! Each background worker reports its cycles here. A component that keeps
//! failing outright is escalated from degraded to unhealthy, which the binary
//! turns into a 503 at `/healthz` and `/readyz`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consecutive failed cycles before a component is reported unhealthy
pub const DEFAULT_UNHEALTHY_AFTER: u32 = 3;

/// Ordered from best to worst, so the aggregate is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Partially failing, or failing for fewer cycles than the escalation limit
    Degraded,
    /// Failed outright for the escalation limit or longer
    Unhealthy,
}

/// Last reported state of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub consecutive_failures: u32,
    pub last_check_timestamp: i64,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl ComponentHealth {
    fn at(status: ComponentStatus, message: Option<String>, consecutive_failures: u32) -> Self {
        Self {
            status,
            message,
            consecutive_failures,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Aggregate served at `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst component status wins; no components means healthy
    pub fn from_components(components: HashMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        Self { status, components }
    }
}

/// Served at `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const BUDGET_MONITOR: &str = "budget_monitor";
    pub const SIGNAL_EVALUATOR: &str = "signal_evaluator";
    pub const STORE: &str = "store";
    pub const LOG_TAIL: &str = "log_tail";
}

/// Shared, cloneable view of every component's health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
    unhealthy_after: u32,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
            unhealthy_after: DEFAULT_UNHEALTHY_AFTER,
        }
    }

    /// Escalate after `cycles` consecutive failures (minimum 1)
    pub fn with_unhealthy_after(mut self, cycles: u32) -> Self {
        self.unhealthy_after = cycles.max(1);
        self
    }

    pub async fn register(&self, name: &str) {
        self.components.write().await.insert(
            name.to_string(),
            ComponentHealth::at(ComponentStatus::Healthy, None, 0),
        );
    }

    /// A clean cycle clears any failure streak
    pub async fn record_success(&self, name: &str) {
        self.components.write().await.insert(
            name.to_string(),
            ComponentHealth::at(ComponentStatus::Healthy, None, 0),
        );
    }

    /// Count one outright failure; the component turns unhealthy once the
    /// streak reaches the escalation limit
    pub async fn record_failure(&self, name: &str, message: impl Into<String>) {
        let mut components = self.components.write().await;
        let streak = components
            .get(name)
            .map_or(0, |c| c.consecutive_failures)
            .saturating_add(1);
        let status = if streak >= self.unhealthy_after {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        };
        components.insert(
            name.to_string(),
            ComponentHealth::at(status, Some(message.into()), streak),
        );
    }

    /// Degraded without counting toward escalation
    pub async fn mark_degraded(&self, name: &str, message: impl Into<String>) {
        self.components.write().await.insert(
            name.to_string(),
            ComponentHealth::at(ComponentStatus::Degraded, Some(message.into()), 0),
        );
    }

    /// Record a worker cycle that attempted `attempted` units of work, of
    /// which `failures` failed. Partial failure degrades; a cycle where
    /// nothing succeeded counts toward escalation.
    pub async fn report_cycle(&self, name: &str, failures: usize, attempted: usize) {
        if failures == 0 {
            self.record_success(name).await;
        } else if failures < attempted {
            self.mark_degraded(name, format!("{failures} of {attempted} checks failed in last cycle"))
                .await;
        } else {
            self.record_failure(name, format!("all {failures} checks failed in last cycle"))
                .await;
        }
    }

    pub async fn status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().await.get(name).map(|h| h.status)
    }

    pub async fn consecutive_failures(&self, name: &str) -> u32 {
        self.components
            .read()
            .await
            .get(name)
            .map_or(0, |h| h.consecutive_failures)
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse::from_components(self.components.read().await.clone())
    }

    /// Ready once initialized, as long as no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let reason = if !*self.ready.read().await {
            Some("Monitor not yet initialized".to_string())
        } else {
            self.components
                .read()
                .await
                .iter()
                .find(|(_, c)| c.status == ComponentStatus::Unhealthy)
                .map(|(name, _)| format!("Component unhealthy: {name}"))
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_registered_component_starts_healthy() {
        let registry = HealthRegistry::new();
        registry.register(components::BUDGET_MONITOR).await;

        assert_eq!(
            registry.status(components::BUDGET_MONITOR).await,
            Some(ComponentStatus::Healthy)
        );
        assert_eq!(registry.status(components::LOG_TAIL).await, None);
    }

    #[tokio::test]
    async fn test_partial_cycle_failure_degrades_without_escalating() {
        let registry = HealthRegistry::new();
        registry.register(components::SIGNAL_EVALUATOR).await;

        for _ in 0..5 {
            registry.report_cycle(components::SIGNAL_EVALUATOR, 2, 5).await;
        }
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        let evaluator = &health.components[components::SIGNAL_EVALUATOR];
        assert_eq!(evaluator.consecutive_failures, 0);
        assert!(evaluator.message.as_deref().unwrap().contains("2 of 5"));

        registry.report_cycle(components::SIGNAL_EVALUATOR, 0, 5).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_failed_cycles_escalate_to_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::SIGNAL_EVALUATOR).await;

        registry.report_cycle(components::SIGNAL_EVALUATOR, 4, 4).await;
        registry.report_cycle(components::SIGNAL_EVALUATOR, 4, 4).await;
        assert_eq!(
            registry.status(components::SIGNAL_EVALUATOR).await,
            Some(ComponentStatus::Degraded)
        );
        assert_eq!(registry.consecutive_failures(components::SIGNAL_EVALUATOR).await, 2);

        registry.report_cycle(components::SIGNAL_EVALUATOR, 4, 4).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);

        // One good cycle recovers fully
        registry.report_cycle(components::SIGNAL_EVALUATOR, 0, 4).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
        assert_eq!(registry.consecutive_failures(components::SIGNAL_EVALUATOR).await, 0);
    }

    #[tokio::test]
    async fn test_partial_cycle_breaks_failure_streak() {
        let registry = HealthRegistry::new().with_unhealthy_after(2);

        registry.record_failure(components::STORE, "locked").await;
        registry.report_cycle(components::STORE, 1, 3).await;
        registry.record_failure(components::STORE, "locked").await;

        assert_eq!(registry.status(components::STORE).await, Some(ComponentStatus::Degraded));
    }

    #[tokio::test]
    async fn test_cycle_without_work_that_failed_counts_as_failure() {
        let registry = HealthRegistry::new().with_unhealthy_after(1);

        registry.report_cycle(components::BUDGET_MONITOR, 1, 0).await;
        assert_eq!(
            registry.status(components::BUDGET_MONITOR).await,
            Some(ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn test_unhealthy_wins_over_degraded() {
        let registry = HealthRegistry::new().with_unhealthy_after(1);
        registry.mark_degraded(components::LOG_TAIL, "reconnecting").await;
        registry.record_failure(components::STORE, "database locked").await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["components"]["store"]["consecutive_failures"], 1);
        assert!(json["components"]["log_tail"].get("consecutive_failures").is_none());
    }

    #[tokio::test]
    async fn test_readiness() {
        let registry = HealthRegistry::new().with_unhealthy_after(1);
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Monitor not yet initialized"));

        registry.register(components::STORE).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.record_failure(components::STORE, "failed").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Component unhealthy: store"));
    }
}

//! Budget threshold monitoring
//!
//! On every tick, compares each budget's trailing spend against its custom
//! alert threshold and the hard 100% line, recording at most one alert per
//! (budget, threshold) per 24 hours.

use crate::backend::{profile_selector, MetricsBackend};
use crate::health::{components, HealthRegistry};
use crate::models::{Budget, NewBudgetAlert, NotifyMethod, Severity};
use crate::notify::{Notification, NotificationDispatcher};
use crate::observability::{MonitorMetrics, StructuredLogger};
use crate::store::{MonitorStore, StoreError};
use crate::worker::{run_periodic, WorkerHandle};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Hard overage threshold checked for every budget
pub const OVERAGE_THRESHOLD_PCT: i64 = 100;

/// Label used for spend query failures in metrics and logs
const SPEND_QUERY: &str = "budget_spend";

/// Budget monitor configuration
#[derive(Debug, Clone)]
pub struct BudgetMonitorConfig {
    /// Time between checks (default: 60 seconds)
    pub interval: Duration,
    /// Window in which an alert suppresses a repeat for the same threshold
    /// (default: 24 hours)
    pub dedup_window: ChronoDuration,
}

impl Default for BudgetMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            dedup_window: ChronoDuration::hours(24),
        }
    }
}

/// Outcome of one check cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetCycleReport {
    pub budgets_checked: usize,
    pub alerts_fired: usize,
    pub failures: usize,
}

/// Periodic budget checker
pub struct BudgetMonitor {
    config: BudgetMonitorConfig,
    backend: Arc<dyn MetricsBackend>,
    store: Arc<dyn MonitorStore>,
    dispatcher: NotificationDispatcher,
    health: Option<HealthRegistry>,
    metrics: MonitorMetrics,
    logger: StructuredLogger,
}

/// PromQL for the spend of `profile` over the budget's period
pub fn spend_query(budget: &Budget) -> String {
    format!(
        "sum(increase(claude_code_cost_usage_USD_total{}[{}]))",
        profile_selector(&budget.profile),
        budget.period.range_literal()
    )
}

/// Thresholds to check for `budget`, custom first, without duplicates
fn thresholds(budget: &Budget) -> Vec<i64> {
    let mut t = vec![budget.alert_threshold_pct];
    if budget.alert_threshold_pct != OVERAGE_THRESHOLD_PCT {
        t.push(OVERAGE_THRESHOLD_PCT);
    }
    t
}

impl BudgetMonitor {
    pub fn new(
        backend: Arc<dyn MetricsBackend>,
        store: Arc<dyn MonitorStore>,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            config: BudgetMonitorConfig::default(),
            backend,
            store,
            dispatcher,
            health: None,
            metrics: MonitorMetrics::new(),
            logger: StructuredLogger::new("loggist"),
        }
    }

    pub fn with_config(mut self, config: BudgetMonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Begin checking now and on every interval
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let interval = self.config.interval;
        WorkerHandle::spawn(components::BUDGET_MONITOR, move |shutdown| async move {
            run_periodic(components::BUDGET_MONITOR, interval, shutdown, move || {
                let monitor = Arc::clone(&self);
                async move {
                    monitor.check_budgets().await;
                }
            })
            .await
        })
    }

    pub async fn check_budgets(&self) -> BudgetCycleReport {
        self.check_budgets_at(Utc::now()).await
    }

    /// Run one cycle as of `now`
    pub async fn check_budgets_at(&self, now: DateTime<Utc>) -> BudgetCycleReport {
        let started = Instant::now();
        let mut report = BudgetCycleReport::default();

        let budgets = match self.store.list_budgets() {
            Ok(b) => {
                if let Some(health) = &self.health {
                    health.record_success(components::STORE).await;
                }
                b
            }
            Err(e) => {
                error!(error = %e, "Failed to load budgets");
                if let Some(health) = &self.health {
                    health
                        .record_failure(components::STORE, format!("list budgets: {e}"))
                        .await;
                }
                report.failures += 1;
                self.finish_cycle(&report, started).await;
                return report;
            }
        };

        for budget in &budgets {
            report.budgets_checked += 1;
            match self.check_budget(budget, now).await {
                Ok(BudgetOutcome { alerts, spend_failed }) => {
                    report.alerts_fired += alerts;
                    if spend_failed {
                        report.failures += 1;
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(budget_id = budget.id, error = %e, "Error checking budget");
                }
            }
        }

        self.finish_cycle(&report, started).await;
        report
    }

    async fn finish_cycle(&self, report: &BudgetCycleReport, started: Instant) {
        self.metrics
            .observe_budget_cycle(started.elapsed().as_secs_f64());
        if let Some(health) = &self.health {
            health
                .report_cycle(
                    components::BUDGET_MONITOR,
                    report.failures,
                    report.budgets_checked,
                )
                .await;
        }
        debug!(
            budgets = report.budgets_checked,
            alerts = report.alerts_fired,
            failures = report.failures,
            "Budget check complete"
        );
    }

    /// Current spend; a failed query counts as zero for this cycle
    async fn current_spend(&self, budget: &Budget) -> Option<f64> {
        let query = spend_query(budget);
        match self.backend.query(&query).await.and_then(|v| v.scalar()) {
            Ok(spend) => Some(spend),
            Err(e) => {
                self.metrics.inc_query_failures(SPEND_QUERY);
                self.logger
                    .log_query_failure(SPEND_QUERY, &budget.profile, 1, &e.to_string());
                None
            }
        }
    }

    async fn check_budget(
        &self,
        budget: &Budget,
        now: DateTime<Utc>,
    ) -> Result<BudgetOutcome, StoreError> {
        if budget.amount_usd <= 0.0 {
            warn!(
                budget_id = budget.id,
                amount_usd = budget.amount_usd,
                "Skipping budget with non-positive amount"
            );
            return Ok(BudgetOutcome {
                alerts: 0,
                spend_failed: false,
            });
        }

        let spend = self.current_spend(budget).await;
        let spend_failed = spend.is_none();
        let spend = spend.unwrap_or(0.0);

        let pct = spend / budget.amount_usd * 100.0;
        let mut alerts = 0;

        for threshold in thresholds(budget) {
            if pct < threshold as f64 {
                continue;
            }
            let since = now - self.config.dedup_window;
            if self.store.has_recent_budget_alert(budget.id, threshold, since)? {
                continue;
            }

            let alert_id = self.store.insert_budget_alert(&NewBudgetAlert {
                budget_id: budget.id,
                triggered_at: now,
                current_amount_usd: spend,
                threshold_pct: threshold,
            })?;
            alerts += 1;
            self.metrics.inc_budget_alerts();
            self.logger
                .log_budget_alert(budget.id, &budget.profile, threshold, spend, budget.amount_usd);

            self.notify(budget, alert_id, threshold, spend, pct);
        }

        Ok(BudgetOutcome {
            alerts,
            spend_failed,
        })
    }

    fn notify(&self, budget: &Budget, alert_id: i64, threshold: i64, spend: f64, pct: f64) {
        let severity = if threshold >= OVERAGE_THRESHOLD_PCT {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let notification = Notification {
            method: budget.notify_method,
            target: budget.notify_url.clone(),
            title: format!(
                "Budget alert: {} {} budget at {}%",
                budget.profile, budget.period, threshold
            ),
            message: format!(
                "Spend ${:.2} of ${:.2} ({:.1}%)",
                spend, budget.amount_usd, pct
            ),
            severity,
        };

        if budget.notify_method == NotifyMethod::Dashboard {
            self.dispatcher.detach(notification);
            return;
        }

        let store = Arc::clone(&self.store);
        self.dispatcher.detach_then(notification, move || {
            if let Err(e) = store.mark_budget_alert_notified(alert_id) {
                warn!(alert_id, error = %e, "Failed to mark budget alert notified");
            }
        });
    }
}

struct BudgetOutcome {
    alerts: usize,
    spend_failed: bool,
}

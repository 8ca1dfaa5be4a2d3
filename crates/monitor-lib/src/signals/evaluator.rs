//! Periodic signal evaluation

use super::rules::{default_rules, RuleContext, SignalRule};
use super::{FailureTracker, RuleId};
use crate::backend::{LogBackend, MetricsBackend};
use crate::health::{components, HealthRegistry};
use crate::models::{NewSignalEvent, NotifyMethod, ALL_PROFILES};
use crate::notify::{Notification, NotificationDispatcher};
use crate::observability::{MonitorMetrics, StructuredLogger};
use crate::store::{MonitorStore, SETTING_NOTIFY_WEBHOOK_URL};
use crate::worker::{run_periodic, WorkerHandle};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Query listing every profile that has reported cost
pub const PROFILE_DISCOVERY_QUERY: &str = "group by (profile) (claude_code_cost_usage_USD_total)";

/// Signal evaluator configuration
#[derive(Debug, Clone)]
pub struct SignalEvaluatorConfig {
    /// Time between cycles (default: 60 seconds)
    pub interval: Duration,
    /// An unacknowledged event suppresses re-evaluation of its rule and
    /// profile for this long (default: 1 hour)
    pub dedup_window: ChronoDuration,
    /// Events older than this are purged (default: 30 days)
    pub retention: ChronoDuration,
    /// Minimum time between purges (default: 24 hours)
    pub housekeeping_interval: ChronoDuration,
}

impl Default for SignalEvaluatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            dedup_window: ChronoDuration::hours(1),
            retention: ChronoDuration::days(30),
            housekeeping_interval: ChronoDuration::hours(24),
        }
    }
}

/// Outcome of one evaluation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalCycleReport {
    pub profiles: Vec<String>,
    pub evaluated: usize,
    pub skipped: usize,
    pub fired: usize,
    pub failures: usize,
    /// Evaluations that got an answer from a backend, excluding the
    /// query_failure meta-rule
    pub answered: usize,
    /// Rows removed by housekeeping, when it ran this cycle
    pub purged: Option<usize>,
}

/// Runs the rule set for every active profile on each tick
pub struct SignalEvaluator {
    config: SignalEvaluatorConfig,
    ctx: RuleContext,
    rules: Vec<Box<dyn SignalRule>>,
    store: Arc<dyn MonitorStore>,
    dispatcher: NotificationDispatcher,
    health: Option<HealthRegistry>,
    metrics: MonitorMetrics,
    logger: StructuredLogger,
    last_purge: Mutex<Option<DateTime<Utc>>>,
}

impl SignalEvaluator {
    pub fn new(
        metrics: Arc<dyn MetricsBackend>,
        logs: Arc<dyn LogBackend>,
        store: Arc<dyn MonitorStore>,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            config: SignalEvaluatorConfig::default(),
            ctx: RuleContext {
                metrics,
                logs,
                failures: Arc::new(FailureTracker::new()),
            },
            rules: default_rules(),
            store,
            dispatcher,
            health: None,
            metrics: MonitorMetrics::new(),
            logger: StructuredLogger::new("loggist"),
            last_purge: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: SignalEvaluatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the rule set; rules run in the given order
    pub fn with_rules(mut self, rules: Vec<Box<dyn SignalRule>>) -> Self {
        self.rules = rules;
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

    pub fn failures(&self) -> &FailureTracker {
        &self.ctx.failures
    }

    /// Begin evaluating now and on every interval
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let interval = self.config.interval;
        WorkerHandle::spawn(components::SIGNAL_EVALUATOR, move |shutdown| async move {
            run_periodic(components::SIGNAL_EVALUATOR, interval, shutdown, move || {
                let evaluator = Arc::clone(&self);
                async move {
                    evaluator.evaluate_cycle().await;
                }
            })
            .await
        })
    }

    pub async fn evaluate_cycle(&self) -> SignalCycleReport {
        self.evaluate_cycle_at(Utc::now()).await
    }

    /// Run one cycle as of `now`
    pub async fn evaluate_cycle_at(&self, now: DateTime<Utc>) -> SignalCycleReport {
        let started = Instant::now();
        let mut report = SignalCycleReport {
            purged: self.housekeeping_at(now),
            ..Default::default()
        };

        report.profiles = self.active_profiles().await;
        let unscoped = [ALL_PROFILES.to_string()];

        for rule in &self.rules {
            let profiles: &[String] = if rule.profile_scoped() {
                &report.profiles
            } else {
                &unscoped
            };

            let queries_backend = rule.id() != RuleId::QueryFailure;
            for profile in profiles {
                let outcome = self.evaluate_pair(rule.as_ref(), profile, now).await;
                if queries_backend && matches!(outcome, PairOutcome::Quiet | PairOutcome::Fired) {
                    report.answered += 1;
                }
                match outcome {
                    PairOutcome::Skipped => report.skipped += 1,
                    PairOutcome::Quiet => report.evaluated += 1,
                    PairOutcome::Fired => {
                        report.evaluated += 1;
                        report.fired += 1;
                    }
                    PairOutcome::Failed => report.failures += 1,
                }
            }
        }

        self.metrics
            .observe_signal_cycle(started.elapsed().as_secs_f64());
        if let Some(health) = &self.health {
            health
                .report_cycle(
                    components::SIGNAL_EVALUATOR,
                    report.failures,
                    report.answered + report.failures,
                )
                .await;
        }
        debug!(
            profiles = report.profiles.len(),
            evaluated = report.evaluated,
            skipped = report.skipped,
            fired = report.fired,
            failures = report.failures,
            "Signal cycle complete"
        );
        report
    }

    /// Profiles that reported cost, or just "all" when none or on failure
    pub async fn active_profiles(&self) -> Vec<String> {
        let mut profiles = match self.ctx.metrics.query(PROFILE_DISCOVERY_QUERY).await {
            Ok(result) => result.label_values("profile"),
            Err(e) => {
                warn!(error = %e, "Profile discovery failed, evaluating all profiles");
                Vec::new()
            }
        };
        profiles.retain(|p| !p.is_empty());
        profiles.sort();
        profiles.dedup();

        if profiles.is_empty() {
            vec![ALL_PROFILES.to_string()]
        } else {
            profiles
        }
    }

    /// Purge old events when the last purge is at least a day old
    ///
    /// Returns the number of rows removed when a purge ran.
    pub fn housekeeping_at(&self, now: DateTime<Utc>) -> Option<usize> {
        let mut last = self.last_purge.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = *last {
            if now - prev < self.config.housekeeping_interval {
                return None;
            }
        }

        match self
            .store
            .delete_signal_events_before(now - self.config.retention)
        {
            Ok(removed) => {
                *last = Some(now);
                if removed > 0 {
                    info!(removed, "Purged old signal events");
                }
                Some(removed)
            }
            Err(e) => {
                warn!(error = %e, "Signal event purge failed");
                None
            }
        }
    }

    async fn evaluate_pair(&self, rule: &dyn SignalRule, profile: &str, now: DateTime<Utc>) -> PairOutcome {
        let rule_id = rule.id();

        match self.store.has_recent_signal_event(
            rule_id.as_str(),
            profile,
            now - self.config.dedup_window,
        ) {
            Ok(true) => return PairOutcome::Skipped,
            Ok(false) => {}
            Err(e) => {
                warn!(rule = %rule_id, profile = %profile, error = %e, "Dedup check failed");
                return PairOutcome::Failed;
            }
        }

        let outcome = match rule.evaluate(&self.ctx, profile).await {
            Ok(outcome) => {
                self.ctx.failures.record_success(rule_id);
                outcome
            }
            Err(e) => {
                let consecutive = self.ctx.failures.record_failure(rule_id);
                self.metrics.inc_query_failures(rule_id.as_str());
                self.logger.log_query_failure(
                    rule_id.as_str(),
                    profile,
                    consecutive,
                    &e.to_string(),
                );
                return PairOutcome::Failed;
            }
        };

        if !outcome.fired {
            return PairOutcome::Quiet;
        }

        let data = match outcome.evidence.to_json() {
            Ok(data) => data,
            Err(e) => {
                warn!(rule = %rule_id, error = %e, "Could not encode evidence");
                return PairOutcome::Failed;
            }
        };

        if let Err(e) = self.store.insert_signal_event(&NewSignalEvent {
            rule_id: rule_id.as_str().to_string(),
            profile: profile.to_string(),
            fired_at: now,
            data: data.clone(),
        }) {
            warn!(rule = %rule_id, profile = %profile, error = %e, "Failed to record signal");
            return PairOutcome::Failed;
        }

        self.metrics.inc_signals_fired(rule_id.as_str());
        self.logger
            .log_signal_fired(rule_id.as_str(), profile, &rule.severity().to_string(), &data);
        self.notify(rule, profile);

        PairOutcome::Fired
    }

    fn notify(&self, rule: &dyn SignalRule, profile: &str) {
        let target = match self.store.get_setting(SETTING_NOTIFY_WEBHOOK_URL) {
            Ok(Some(url)) if !url.is_empty() => url,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read notification webhook setting");
                return;
            }
        };

        self.dispatcher.detach(Notification {
            method: NotifyMethod::Webhook,
            target: Some(target),
            title: format!("Signal: {} ({})", rule.name(), profile),
            message: rule.description().to_string(),
            severity: rule.severity(),
        });
    }
}

enum PairOutcome {
    Skipped,
    Quiet,
    Fired,
    Failed,
}

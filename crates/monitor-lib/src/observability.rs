//! Observability infrastructure for the monitor
//!
//! Provides:
//! - Prometheus metrics (worker cycle latency, alert and signal counters,
//!   backend failures, notification failures, stream subscribers)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for worker cycle latency (in seconds); cycles are
/// bounded by backend timeouts of up to 30s per query
const CYCLE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MonitorMetricsInner> = OnceLock::new();

struct MonitorMetricsInner {
    budget_cycle_seconds: Histogram,
    signal_cycle_seconds: Histogram,
    budget_alerts: IntCounter,
    signals_fired: IntCounterVec,
    query_failures: IntCounterVec,
    notifications_failed: IntCounterVec,
    rate_limited: IntCounter,
    stream_subscribers: IntGauge,
    stream_batches: IntCounter,
}

impl MonitorMetricsInner {
    fn new() -> Self {
        Self {
            budget_cycle_seconds: register_histogram!(
                "loggist_budget_cycle_duration_seconds",
                "Time spent checking every budget in one cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register budget_cycle_duration_seconds"),

            signal_cycle_seconds: register_histogram!(
                "loggist_signal_cycle_duration_seconds",
                "Time spent evaluating every signal rule in one cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register signal_cycle_duration_seconds"),

            budget_alerts: register_int_counter!(
                "loggist_budget_alerts_total",
                "Budget alerts recorded"
            )
            .expect("Failed to register budget_alerts_total"),

            signals_fired: register_int_counter_vec!(
                "loggist_signals_fired_total",
                "Signal events recorded, by rule",
                &["rule"]
            )
            .expect("Failed to register signals_fired_total"),

            query_failures: register_int_counter_vec!(
                "loggist_backend_query_failures_total",
                "Failed metrics/log backend queries, by rule",
                &["rule"]
            )
            .expect("Failed to register backend_query_failures_total"),

            notifications_failed: register_int_counter_vec!(
                "loggist_notifications_failed_total",
                "Notifications that could not be delivered, by method",
                &["method"]
            )
            .expect("Failed to register notifications_failed_total"),

            rate_limited: register_int_counter!(
                "loggist_rate_limited_requests_total",
                "Requests rejected by the rate limiter"
            )
            .expect("Failed to register rate_limited_requests_total"),

            stream_subscribers: register_int_gauge!(
                "loggist_stream_subscribers",
                "Live event stream subscribers"
            )
            .expect("Failed to register stream_subscribers"),

            stream_batches: register_int_counter!(
                "loggist_stream_batches_total",
                "Log event batches fanned out to subscribers"
            )
            .expect("Failed to register stream_batches_total"),
        }
    }
}

/// Monitor metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct MonitorMetrics {
    _private: (),
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MonitorMetricsInner {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new)
    }

    pub fn observe_budget_cycle(&self, duration_secs: f64) {
        self.inner().budget_cycle_seconds.observe(duration_secs);
    }

    pub fn observe_signal_cycle(&self, duration_secs: f64) {
        self.inner().signal_cycle_seconds.observe(duration_secs);
    }

    pub fn inc_budget_alerts(&self) {
        self.inner().budget_alerts.inc();
    }

    pub fn inc_signals_fired(&self, rule: &str) {
        self.inner().signals_fired.with_label_values(&[rule]).inc();
    }

    pub fn inc_query_failures(&self, rule: &str) {
        self.inner().query_failures.with_label_values(&[rule]).inc();
    }

    pub fn inc_notifications_failed(&self, method: &str) {
        self.inner()
            .notifications_failed
            .with_label_values(&[method])
            .inc();
    }

    pub fn inc_rate_limited(&self) {
        self.inner().rate_limited.inc();
    }

    /// Gauge of live stream subscribers, kept current by the broadcaster
    pub fn stream_subscribers(&self) -> IntGauge {
        self.inner().stream_subscribers.clone()
    }

    pub fn inc_stream_batches(&self) {
        self.inner().stream_batches.inc();
    }
}

/// Structured logger for monitor events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "monitor_started",
            instance = %self.instance,
            version = %version,
            "Loggist monitor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "monitor_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Loggist monitor shutting down"
        );
    }

    pub fn log_budget_alert(
        &self,
        budget_id: i64,
        profile: &str,
        threshold_pct: i64,
        spend_usd: f64,
        amount_usd: f64,
    ) {
        warn!(
            event = "budget_alert",
            instance = %self.instance,
            budget_id = budget_id,
            profile = %profile,
            threshold_pct = threshold_pct,
            spend_usd = spend_usd,
            amount_usd = amount_usd,
            "Budget threshold crossed"
        );
    }

    pub fn log_signal_fired(&self, rule: &str, profile: &str, severity: &str, evidence: &str) {
        warn!(
            event = "signal_fired",
            instance = %self.instance,
            rule = %rule,
            profile = %profile,
            severity = %severity,
            evidence = %evidence,
            "Signal fired"
        );
    }

    pub fn log_query_failure(&self, rule: &str, profile: &str, consecutive: u32, error: &str) {
        warn!(
            event = "backend_query_failed",
            instance = %self.instance,
            rule = %rule,
            profile = %profile,
            consecutive_failures = consecutive,
            error = %error,
            "Backend query failed"
        );
    }

    pub fn log_notification_failure(&self, method: &str, title: &str, error: &str) {
        warn!(
            event = "notification_failed",
            instance = %self.instance,
            method = %method,
            title = %title,
            error = %error,
            "Notification delivery failed"
        );
    }
}

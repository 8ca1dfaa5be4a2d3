//! Loggist monitor - background monitoring engine
//!
//! Runs the budget monitor, the signal evaluator and the live log tail, and
//! serves health, metrics and the dashboard's stream and chart routes.

use anyhow::{Context, Result};
use monitor_lib::{
    backend::{LokiClient, PrometheusClient},
    budget::{BudgetMonitor, BudgetMonitorConfig},
    fanout::{Broadcaster, LokiTail},
    health::{components, HealthRegistry},
    notify::{drain_failures, HttpNotifier, NotificationDispatcher},
    observability::{MonitorMetrics, StructuredLogger},
    ratelimit::RateLimiter,
    signals::{SignalEvaluator, SignalEvaluatorConfig},
    store::SqliteStore,
    worker::{run_periodic, WorkerHandle},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const MONITOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Rate limiter buckets idle this long are dropped
const LIMITER_IDLE: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting loggist-monitor");

    let config = config::MonitorConfig::load()?;
    info!(
        instance = %config.instance_name,
        prometheus = %config.prometheus_url,
        loki = %config.loki_url,
        "Monitor configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::BUDGET_MONITOR).await;
    health_registry.register(components::SIGNAL_EVALUATOR).await;
    if config.log_tail_enabled {
        health_registry.register(components::LOG_TAIL).await;
    }

    let metrics = MonitorMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(MONITOR_VERSION);

    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .with_context(|| format!("Failed to open database at {}", config.database_path))?,
    );
    health_registry.register(components::STORE).await;
    let prometheus = Arc::new(
        PrometheusClient::new(&config.prometheus_url).context("Invalid LOGGIST_PROMETHEUS_URL")?,
    );
    let loki = Arc::new(LokiClient::new(&config.loki_url).context("Invalid LOGGIST_LOKI_URL")?);

    let notifier = HttpNotifier::new().context("Failed to build notification client")?;
    let (dispatcher, failures) = NotificationDispatcher::new(Arc::new(notifier));
    tokio::spawn(drain_failures(failures, logger.clone(), metrics.clone()));

    let budget_monitor = BudgetMonitor::new(prometheus.clone(), store.clone(), dispatcher.clone())
        .with_config(BudgetMonitorConfig {
            interval: config.budget_check_interval(),
            ..Default::default()
        })
        .with_health(health_registry.clone())
        .with_logger(logger.clone());

    let signal_evaluator = SignalEvaluator::new(prometheus.clone(), loki, store, dispatcher)
        .with_config(SignalEvaluatorConfig {
            interval: config.signal_check_interval(),
            ..Default::default()
        })
        .with_health(health_registry.clone())
        .with_logger(logger.clone());

    let mut workers = vec![
        Arc::new(budget_monitor).start(),
        Arc::new(signal_evaluator).start(),
    ];

    let broadcaster = Broadcaster::new(config.max_stream_subscribers);
    if config.log_tail_enabled {
        let tail = LokiTail::new(&config.loki_url, broadcaster.clone())
            .context("Invalid LOGGIST_LOKI_URL")?
            .with_health(health_registry.clone());
        workers.push(tail.start());
    }

    let app_state = Arc::new(api::AppState {
        health_registry: health_registry.clone(),
        metrics: metrics.clone(),
        broadcaster,
        limiter: RateLimiter::new(config.rate_limit_capacity, config.rate_limit_refill_per_sec),
        prometheus,
    });

    let prune_state = app_state.clone();
    workers.push(WorkerHandle::spawn("rate_limit_prune", move |shutdown| async move {
        run_periodic("rate_limit_prune", LIMITER_IDLE, shutdown, move || {
            let state = prune_state.clone();
            async move {
                let pruned = state.limiter.prune_idle(LIMITER_IDLE);
                debug!(pruned, tracked = state.limiter.tracked_keys(), "Pruned rate limiter");
            }
        })
        .await
    }));

    // Mark monitor as ready after initialization
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            let reason = match result {
                Ok(Ok(())) => "API server exited".to_string(),
                Ok(Err(e)) => format!("API server failed: {e}"),
                Err(e) => format!("API server task failed: {e}"),
            };
            logger.log_shutdown(&reason);
        }
    }

    health_registry.set_ready(false).await;
    for worker in workers {
        let name = worker.name();
        worker.stop().await;
        debug!(worker = name, "Worker stopped");
    }
    info!("Shutting down");

    Ok(())
}

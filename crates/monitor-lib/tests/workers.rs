//! End-to-end worker tests against mock Prometheus, Loki and webhook servers

use mockito::{Matcher, Server, ServerGuard};
use monitor_lib::backend::{LokiClient, PrometheusClient};
use monitor_lib::budget::BudgetMonitor;
use monitor_lib::fanout::{parse_tail_frame, Broadcaster};
use monitor_lib::notify::{HttpNotifier, NotificationDispatcher};
use monitor_lib::signals::{
    CacheEfficiencyDropRule, CostSpikeRule, DataCollectionStoppedRule, Evidence, RuleId,
    SignalEvaluator, SignalEvaluatorConfig, PROFILE_DISCOVERY_QUERY,
};
use monitor_lib::store::{MonitorStore, SignalEventFilter, SqliteStore, SETTING_NOTIFY_WEBHOOK_URL};
use monitor_lib::health::components;
use monitor_lib::{BudgetPeriod, ComponentStatus, HealthRegistry, NewBudget, NotifyMethod};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn vector_body(series: serde_json::Value) -> String {
    json!({
        "status": "success",
        "data": { "resultType": "vector", "result": series }
    })
    .to_string()
}

fn scalar_body(value: &str) -> String {
    vector_body(json!([{ "metric": {}, "value": [1700000000, value] }]))
}

async fn mock_query(server: &mut ServerGuard, path: &str, query: &str, body: String) -> mockito::Mock {
    server
        .mock("GET", path)
        .match_query(Matcher::UrlEncoded("query".into(), query.into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await
}

fn dispatcher() -> NotificationDispatcher {
    let (dispatcher, _failures) = NotificationDispatcher::new(Arc::new(HttpNotifier::new().unwrap()));
    dispatcher
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_budget_alert_delivered_to_webhook() {
    let mut prometheus = Server::new_async().await;
    let mut hooks = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("data/loggist.db")).unwrap());

    let spend = prometheus
        .mock("GET", "/api/v1/query")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(scalar_body("92.5"))
        .expect(1)
        .create_async()
        .await;
    let hook = hooks
        .mock("POST", "/budget")
        .match_body(Matcher::PartialJson(json!({ "severity": "warning" })))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let budget = store
        .insert_budget(&NewBudget {
            period: BudgetPeriod::Monthly,
            amount_usd: 100.0,
            alert_threshold_pct: 80,
            notify_method: NotifyMethod::Webhook,
            notify_url: Some(format!("{}/budget", hooks.url())),
            ..Default::default()
        })
        .unwrap();

    let monitor = BudgetMonitor::new(
        Arc::new(PrometheusClient::new(&prometheus.url()).unwrap()),
        store.clone(),
        dispatcher(),
    );
    let report = monitor.check_budgets().await;

    assert_eq!(report.budgets_checked, 1);
    assert_eq!(report.alerts_fired, 1);
    assert_eq!(report.failures, 0);

    wait_for(|| {
        store
            .list_budget_alerts(Some(budget.id), 10)
            .unwrap()
            .iter()
            .all(|a| a.notified)
    })
    .await;
    let alerts = store.list_budget_alerts(Some(budget.id), 10).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].threshold_pct, 80);
    assert_eq!(alerts[0].current_amount_usd, 92.5);

    spend.assert_async().await;
    hook.assert_async().await;
}

#[tokio::test]
async fn test_signal_cycle_against_backends() {
    let mut prometheus = Server::new_async().await;
    let mut loki = Server::new_async().await;
    let mut hooks = Server::new_async().await;
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());

    // Mocks unregister on drop
    let _discovery =
        mock_query(&mut prometheus, "/api/v1/query", PROFILE_DISCOVERY_QUERY, vector_body(json!([]))).await;
    let _down = mock_query(
        &mut prometheus,
        "/api/v1/query",
        DataCollectionStoppedRule::QUERY,
        vector_body(json!([{
            "metric": { "__name__": "up", "instance": "otel:8888", "job": "otel-collector" },
            "value": [1700000000, "0"]
        }])),
    )
    .await;
    let _cost =
        mock_query(&mut prometheus, "/api/v1/query", &CostSpikeRule::current_query("all"), scalar_body("0.4")).await;
    let _cache_read = mock_query(
        &mut prometheus,
        "/api/v1/query",
        &CacheEfficiencyDropRule::cache_read_query("all"),
        scalar_body("40"),
    )
    .await;
    let _total_tokens = mock_query(
        &mut prometheus,
        "/api/v1/query",
        &CacheEfficiencyDropRule::total_tokens_query("all"),
        scalar_body("100"),
    )
    .await;
    let _errors = loki
        .mock("GET", "/loki/api/v1/query")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(scalar_body("1"))
        .create_async()
        .await;
    let hook = hooks
        .mock("POST", "/signals")
        .match_body(Matcher::PartialJson(json!({
            "title": "Signal: Data collection stopped (all)",
            "severity": "critical"
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    store
        .put_setting(SETTING_NOTIFY_WEBHOOK_URL, &format!("{}/signals", hooks.url()))
        .unwrap();

    let evaluator = SignalEvaluator::new(
        Arc::new(PrometheusClient::new(&prometheus.url()).unwrap()),
        Arc::new(LokiClient::new(&loki.url()).unwrap()),
        store.clone(),
        dispatcher(),
    );

    let report = evaluator.evaluate_cycle().await;
    assert_eq!(report.profiles, vec!["all"]);
    assert_eq!(report.failures, 0);
    assert_eq!(report.fired, 1);

    let events = store
        .list_signal_events(&SignalEventFilter::default())
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].rule_id, RuleId::DataCollectionStopped.as_str());
    match events[0].evidence().unwrap() {
        Evidence::DataCollectionStopped(e) => assert_eq!(e.instances, vec!["otel:8888"]),
        other => panic!("unexpected evidence: {other:?}"),
    }

    // Still down, but deduplicated within the hour
    let again = evaluator.evaluate_cycle().await;
    assert_eq!(again.fired, 0);
    assert_eq!(again.skipped, 1);

    for _ in 0..200 {
        if hook.matched_async().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    hook.assert_async().await;
}

#[tokio::test]
async fn test_backends_behind_path_prefix() {
    let mut gateway = Server::new_async().await;
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());

    let prometheus = gateway
        .mock("GET", "/prom/api/v1/query")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(vector_body(json!([])))
        .expect_at_least(1)
        .create_async()
        .await;
    let logs = gateway
        .mock("GET", "/logs/loki/api/v1/query")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(scalar_body("0"))
        .expect_at_least(1)
        .create_async()
        .await;

    let evaluator = SignalEvaluator::new(
        Arc::new(PrometheusClient::new(&format!("{}/prom", gateway.url())).unwrap()),
        Arc::new(LokiClient::new(&format!("{}/logs", gateway.url())).unwrap()),
        store,
        dispatcher(),
    );

    let report = evaluator.evaluate_cycle().await;
    assert_eq!(report.failures, 0);
    prometheus.assert_async().await;
    logs.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_backends_surface_as_query_failure() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let health = HealthRegistry::new();
    health.register(components::SIGNAL_EVALUATOR).await;
    let evaluator = SignalEvaluator::new(
        Arc::new(PrometheusClient::new("http://127.0.0.1:1").unwrap()),
        Arc::new(LokiClient::new("http://127.0.0.1:1").unwrap()),
        store.clone(),
        dispatcher(),
    )
    .with_config(SignalEvaluatorConfig {
        interval: Duration::from_secs(3600),
        ..Default::default()
    })
    .with_health(health.clone());

    for _ in 0..3 {
        let report = evaluator.evaluate_cycle().await;
        assert_eq!(report.failures, 4);
    }
    assert_eq!(health.health().await.status, ComponentStatus::Unhealthy);
    assert!(!health.readiness().await.ready);

    let report = evaluator.evaluate_cycle().await;
    assert_eq!(report.fired, 1);

    let raised = store
        .list_signal_events(&SignalEventFilter {
            rule_id: Some("query_failure".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(raised.len(), 1);
    match raised[0].evidence().unwrap() {
        Evidence::QueryFailure(e) => {
            let ids: Vec<RuleId> = e.failing_rules.iter().map(|f| f.rule_id).collect();
            assert_eq!(
                ids,
                vec![
                    RuleId::CostSpike,
                    RuleId::ApiErrorBurst,
                    RuleId::DataCollectionStopped,
                    RuleId::CacheEfficiencyDrop
                ]
            );
        }
        other => panic!("unexpected evidence: {other:?}"),
    }
}

#[tokio::test]
async fn test_tail_frame_reaches_subscribers_redacted() {
    let broadcaster = Broadcaster::new(2);
    let mut subscriber = broadcaster.subscribe().unwrap();

    let frame = json!({
        "streams": [{
            "stream": { "service_name": "claude-code" },
            "values": [[
                "1700000000000000000",
                r#"{"event_name":"api_request","prompt":"use api_key=abc123 please"}"#
            ]]
        }]
    })
    .to_string();

    let events = parse_tail_frame(&frame).unwrap();
    assert_eq!(broadcaster.publish(&events), 1);

    let batch = subscriber.recv().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].timestamp, "1700000000000000000");
    assert_eq!(batch[0].fields["prompt"], "use [REDACTED] please");
    assert_eq!(batch[0].fields["event_name"], "api_request");

    // The parsed input is not modified
    assert_eq!(events[0].fields["prompt"], "use api_key=abc123 please");
}

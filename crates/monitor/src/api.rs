//! HTTP API: health checks, Prometheus metrics, the live event stream and
//! downsampled range queries

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use monitor_lib::{
    backend::{profile_selector, MetricsBackend, RangeMatrix},
    downsample::downsample_series,
    fanout::Broadcaster,
    health::{ComponentStatus, HealthRegistry},
    observability::MonitorMetrics,
    ratelimit::{RateLimitDecision, RateLimiter},
    ALL_PROFILES,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const STREAM_KEEP_ALIVE: Duration = Duration::from_secs(15);
const DEFAULT_MAX_POINTS: usize = 300;
const MAX_POINTS_LIMIT: usize = 2000;
const MIN_STEP_SECS: u64 = 15;

/// Shared application state
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: MonitorMetrics,
    pub broadcaster: Broadcaster,
    pub limiter: RateLimiter,
    pub prometheus: Arc<dyn MetricsBackend>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Health check response - 503 only once a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = if health.status == ComponentStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Live log events as server-sent events, one frame per sanitized batch
async fn event_stream(State(state): State<Arc<AppState>>) -> Response {
    let subscription = match state.broadcaster.subscribe() {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = %e, "Rejected event stream subscriber");
            return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many stream connections");
        }
    };
    let stream = subscription.map(|batch| Event::default().json_data(batch.as_ref()));

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(STREAM_KEEP_ALIVE))
        .into_response()
}

/// Fixed counters the range endpoint may chart
fn preset_metric(preset: &str) -> Option<&'static str> {
    match preset {
        "cost" => Some("claude_code_cost_usage_USD_total"),
        "tokens" => Some("claude_code_token_usage_tokens_total"),
        "cache_read" => Some("claude_code_cache_read_input_tokens_total"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeParams {
    pub preset: String,
    #[serde(default)]
    pub profile: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub step: Option<u64>,
    pub max_points: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RangeResponse {
    result_type: &'static str,
    result: RangeMatrix,
}

/// Step that yields about `max_points` samples over the window
fn auto_step(start: i64, end: i64, max_points: usize) -> u64 {
    let span = end.saturating_sub(start).max(0) as u64;
    span.div_ceil(max_points as u64).max(MIN_STEP_SECS)
}

async fn query_range(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeParams>,
) -> Response {
    let Some(metric) = preset_metric(&params.preset) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Unknown preset: {}", params.preset),
        );
    };
    let (Some(start), Some(end)) = (params.start, params.end) else {
        return error_response(StatusCode::BAD_REQUEST, "start and end are required");
    };
    if end < start {
        return error_response(StatusCode::BAD_REQUEST, "end must not precede start");
    }

    let max_points = params
        .max_points
        .unwrap_or(DEFAULT_MAX_POINTS)
        .clamp(1, MAX_POINTS_LIMIT);
    let step = params
        .step
        .filter(|s| *s > 0)
        .unwrap_or_else(|| auto_step(start, end, max_points));
    let profile = params.profile.as_deref().unwrap_or(ALL_PROFILES);
    let expr = format!("sum(rate({metric}{}[5m]))", profile_selector(profile));

    match state.prometheus.query_range(&expr, start, end, step).await {
        Ok(mut matrix) => {
            downsample_series(&mut matrix, max_points);
            Json(RangeResponse {
                result_type: "matrix",
                result: matrix,
            })
            .into_response()
        }
        Err(e) => {
            warn!(preset = %params.preset, error = %e, "Range query failed");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// Client identity for rate limiting
fn client_key(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded.or(real_ip).unwrap_or("unknown").to_string()
}

async fn rate_limit(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let key = client_key(request.headers());

    match state.limiter.check(&key) {
        RateLimitDecision::Allowed { remaining } => {
            let mut response = next.run(request).await;
            response
                .headers_mut()
                .insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
        RateLimitDecision::Denied { retry_after } => {
            state.metrics.inc_rate_limited();
            let mut response =
                error_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after.as_secs()));
            response
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/events/stream", get(event_stream))
        .route("/metrics/query_range", get(query_range))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .nest("/api", api)
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

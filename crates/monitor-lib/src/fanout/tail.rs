//! Websocket tail of the log backend

use super::{Broadcaster, LogEvent};
use crate::backend::{endpoint, BackendError, LogStream};
use crate::health::{components, HealthRegistry};
use crate::observability::MonitorMetrics;
use crate::worker::WorkerHandle;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Tail subscription settings
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// LogQL stream selector to follow
    pub query: String,
    /// Maximum entries the backend sends per frame
    pub limit: u32,
    /// Pause before reconnecting after the socket closes or fails
    pub reconnect_delay: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            query: r#"{service_name="claude-code"}"#.to_string(),
            limit: 100,
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TailFrame {
    #[serde(default)]
    streams: Vec<LogStream>,
}

/// Parse one tail frame into events
///
/// Streams carrying an `event_name` label take their fields from the labels;
/// otherwise the line is read as a JSON object, falling back to `{raw: line}`.
pub fn parse_tail_frame(text: &str) -> Result<Vec<LogEvent>, BackendError> {
    let frame: TailFrame =
        serde_json::from_str(text).map_err(|e| BackendError::Decode(e.to_string()))?;

    let mut events = Vec::new();
    for stream in frame.streams {
        let from_labels = stream.stream.contains_key("event_name");
        for (ts_nano, line) in stream.values {
            let mut fields: Map<String, Value> = if from_labels {
                stream
                    .stream
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect()
            } else {
                match serde_json::from_str::<Value>(&line) {
                    Ok(Value::Object(map)) => map,
                    _ => {
                        let mut map = Map::new();
                        map.insert("raw".into(), Value::String(line));
                        map
                    }
                }
            };
            fields.remove("timestamp");
            events.push(LogEvent {
                timestamp: ts_nano,
                fields,
            });
        }
    }
    Ok(events)
}

/// Follows the log backend's tail endpoint and publishes every frame
pub struct LokiTail {
    base_url: Url,
    config: TailConfig,
    broadcaster: Broadcaster,
    health: Option<HealthRegistry>,
    metrics: MonitorMetrics,
}

impl LokiTail {
    pub fn new(loki_url: &str, broadcaster: Broadcaster) -> Result<Self, BackendError> {
        Ok(Self {
            base_url: Url::parse(loki_url)?,
            config: TailConfig::default(),
            broadcaster,
            health: None,
            metrics: MonitorMetrics::new(),
        })
    }

    pub fn with_config(mut self, config: TailConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Websocket tail URL starting at `start_ns`
    pub fn tail_url(&self, start_ns: i64) -> Result<Url, BackendError> {
        let mut url = endpoint(&self.base_url, &["loki", "api", "v1", "tail"])?;
        let scheme = if self.base_url.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        url.set_scheme(scheme)
            .map_err(|_| BackendError::Decode(format!("cannot tail {}", self.base_url)))?;
        url.query_pairs_mut()
            .append_pair("query", &self.config.query)
            .append_pair("delay_for", "0")
            .append_pair("limit", &self.config.limit.to_string())
            .append_pair("start", &start_ns.to_string());
        Ok(url)
    }

    /// Spawn the tail loop
    pub fn start(self) -> WorkerHandle {
        WorkerHandle::spawn(components::LOG_TAIL, move |shutdown| self.run(shutdown))
    }

    /// Connect, stream and reconnect until `shutdown` fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(query = %self.config.query, "Starting log tail");

        loop {
            let start_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
            let outcome = match self.tail_url(start_ns) {
                Ok(url) => {
                    tokio::select! {
                        r = self.stream_once(&url) => r,
                        _ = shutdown.recv() => break,
                    }
                }
                Err(e) => Err(e.to_string()),
            };

            let reason = match outcome {
                Ok(()) => "connection closed".to_string(),
                Err(e) => e,
            };
            warn!(
                reason = %reason,
                retry_secs = self.config.reconnect_delay.as_secs(),
                "Log tail disconnected, reconnecting"
            );
            if let Some(health) = &self.health {
                health.mark_degraded(components::LOG_TAIL, reason).await;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Log tail stopped");
    }

    async fn stream_once(&self, url: &Url) -> Result<(), String> {
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| format!("connect failed: {e}"))?;
        debug!(url = %url, "Log tail connected");
        if let Some(health) = &self.health {
            health.record_success(components::LOG_TAIL).await;
        }

        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handle_frame(&text),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle_frame(text),
                    Err(e) => warn!(error = %e, "Log tail sent non-UTF-8 frame"),
                },
                Ok(Message::Close(_)) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(format!("websocket error: {e}")),
            }
        }
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        match parse_tail_frame(text) {
            Ok(events) if events.is_empty() => {}
            Ok(events) => {
                let reached = self.broadcaster.publish(&events);
                self.metrics.inc_stream_batches();
                debug!(events = events.len(), subscribers = reached, "Published log batch");
            }
            Err(e) => warn!(error = %e, "Failed to parse log tail frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_labels_when_event_name_present() {
        let frame = r#"{"streams":[{"stream":{"event_name":"api_request","model":"opus","timestamp":"x"},
            "values":[["1712345678000000001","ignored line"]]}]}"#;
        let events = parse_tail_frame(frame).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, "1712345678000000001");
        assert_eq!(events[0].fields["event_name"], json!("api_request"));
        assert_eq!(events[0].fields["model"], json!("opus"));
        assert!(!events[0].fields.contains_key("timestamp"));
    }

    #[test]
    fn test_parse_json_line_and_raw_fallback() {
        let frame = r#"{"streams":[{"stream":{"job":"x"},"values":[
            ["1","{\"cost\":0.25,\"tool\":\"Read\"}"],
            ["2","plain text line"],
            ["3","[1,2,3]"]]}]}"#;
        let events = parse_tail_frame(frame).unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].fields["cost"], json!(0.25));
        assert_eq!(events[1].fields["raw"], json!("plain text line"));
        assert_eq!(events[2].fields["raw"], json!("[1,2,3]"));
    }

    #[test]
    fn test_frame_without_streams() {
        assert!(parse_tail_frame(r#"{"dropped_entries":[]}"#).unwrap().is_empty());
        assert!(parse_tail_frame("not json").is_err());
    }

    #[test]
    fn test_tail_url() {
        let tail = LokiTail::new("https://loki.internal:3100", Broadcaster::default()).unwrap();
        let url = tail.tail_url(42).unwrap();

        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/loki/api/v1/tail");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("query".into(), r#"{service_name="claude-code"}"#.into())));
        assert!(pairs.contains(&("delay_for".into(), "0".into())));
        assert!(pairs.contains(&("limit".into(), "100".into())));
        assert!(pairs.contains(&("start".into(), "42".into())));

        let plain = LokiTail::new("http://localhost:3100", Broadcaster::default()).unwrap();
        assert_eq!(plain.tail_url(0).unwrap().scheme(), "ws");

        let proxied =
            LokiTail::new("https://gateway.local/loki-proxy", Broadcaster::default()).unwrap();
        let url = proxied.tail_url(0).unwrap();
        assert_eq!(
            url.as_str().split('?').next(),
            Some("wss://gateway.local/loki-proxy/loki/api/v1/tail")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown_while_unreachable() {
        let health = HealthRegistry::new();
        let tail = LokiTail::new("http://127.0.0.1:1", Broadcaster::default())
            .unwrap()
            .with_health(health.clone());

        let handle = tail.start();
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.stop().await;

        assert_eq!(
            health.status(components::LOG_TAIL).await,
            Some(crate::health::ComponentStatus::Degraded)
        );
    }
}

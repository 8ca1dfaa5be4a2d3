//! Metrics and log backend contracts
//!
//! The monitoring workers only ever see these two traits. `prometheus` and
//! `loki` hold the HTTP implementations.

mod loki;
mod prometheus;

pub use self::loki::LokiClient;
pub use self::prometheus::PrometheusClient;

use crate::models::{SeriesPoint, ALL_PROFILES};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Timeout for instant queries
pub const INSTANT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for range queries
pub const RANGE_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a metrics or log backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("backend reported error: {0}")]
    Api(String),

    #[error("could not decode backend response: {0}")]
    Decode(String),

    #[error("backend query timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),
}

impl BackendError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(timeout)
        } else {
            BackendError::Transport(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Append `segments` to the base URL's path, keeping any prefix such as a
/// reverse-proxy mount point
pub(crate) fn endpoint(base: &url::Url, segments: &[&str]) -> Result<url::Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Label set of a series
pub type Labels = BTreeMap<String, String>;

/// One series of an instant query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantSeries {
    #[serde(default)]
    pub metric: Labels,
    pub value: SeriesPoint,
}

/// One series of a range query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeSeries {
    #[serde(default)]
    pub metric: Labels,
    #[serde(default)]
    pub values: Vec<SeriesPoint>,
}

/// Result of an instant query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstantVector {
    pub series: Vec<InstantSeries>,
}

impl InstantVector {
    pub fn new(series: Vec<InstantSeries>) -> Self {
        Self { series }
    }

    /// First sample's value; 0 when the result is empty
    pub fn scalar(&self) -> Result<f64> {
        match self.series.first() {
            None => Ok(0.0),
            Some(s) => s.value.value.parse::<f64>().map_err(|_| {
                BackendError::Decode(format!("non-numeric sample value {:?}", s.value.value))
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Values of `label` across all series, skipping series without it
    pub fn label_values(&self, label: &str) -> Vec<String> {
        self.series
            .iter()
            .filter_map(|s| s.metric.get(label).cloned())
            .collect()
    }
}

/// Result of a range query
pub type RangeMatrix = Vec<RangeSeries>;

/// One log stream: its labels and `(timestamp ns, line)` entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogStream {
    #[serde(default)]
    pub stream: Labels,
    #[serde(default)]
    pub values: Vec<(String, String)>,
}

/// Result of a log query; metric-style log queries yield vectors or matrices
#[derive(Debug, Clone, PartialEq)]
pub enum LogQueryData {
    Streams(Vec<LogStream>),
    Vector(InstantVector),
    Matrix(RangeMatrix),
}

impl LogQueryData {
    /// Sum of the latest value of every series; streams count their lines
    pub fn total(&self) -> f64 {
        match self {
            LogQueryData::Streams(streams) => streams.iter().map(|s| s.values.len() as f64).sum(),
            LogQueryData::Vector(v) => v
                .series
                .iter()
                .map(|s| s.value.numeric())
                .filter(|v| v.is_finite())
                .sum(),
            LogQueryData::Matrix(m) => m
                .iter()
                .filter_map(|s| s.values.last())
                .map(SeriesPoint::numeric)
                .filter(|v| v.is_finite())
                .sum(),
        }
    }
}

/// Query envelope's `data` member, shared by both backends
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryData {
    pub result_type: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

impl QueryData {
    pub(crate) fn into_log_data(self) -> Result<LogQueryData> {
        let decode = |e: serde_json::Error| BackendError::Decode(e.to_string());
        match self.result_type.as_str() {
            "streams" => Ok(LogQueryData::Streams(
                serde_json::from_value(self.result).map_err(decode)?,
            )),
            "vector" => Ok(LogQueryData::Vector(
                serde_json::from_value(self.result).map_err(decode)?,
            )),
            "matrix" => Ok(LogQueryData::Matrix(
                serde_json::from_value(self.result).map_err(decode)?,
            )),
            other => Err(BackendError::Decode(format!("unexpected resultType {other}"))),
        }
    }

    pub(crate) fn into_vector(self) -> Result<InstantVector> {
        match self.into_log_data()? {
            LogQueryData::Vector(v) => Ok(v),
            LogQueryData::Streams(_) | LogQueryData::Matrix(_) => {
                Err(BackendError::Decode("expected vector result".into()))
            }
        }
    }

    pub(crate) fn into_matrix(self) -> Result<RangeMatrix> {
        match self.into_log_data()? {
            LogQueryData::Matrix(m) => Ok(m),
            LogQueryData::Streams(_) | LogQueryData::Vector(_) => {
                Err(BackendError::Decode("expected matrix result".into()))
            }
        }
    }
}

/// `{status, data, error}` response envelope
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub status: String,
    pub data: Option<QueryData>,
    pub error: Option<String>,
}

impl Envelope {
    pub(crate) fn into_data(self) -> Result<QueryData> {
        if self.status != "success" {
            return Err(BackendError::Api(
                self.error.unwrap_or_else(|| format!("status {}", self.status)),
            ));
        }
        self.data
            .ok_or_else(|| BackendError::Decode("success response without data".into()))
    }
}

/// Instant and range queries against a Prometheus-compatible store
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn query(&self, expr: &str) -> Result<InstantVector>;

    /// Range query; `start`/`end` in unix seconds, `step` in seconds
    async fn query_range(&self, expr: &str, start: i64, end: i64, step: u64)
        -> Result<RangeMatrix>;
}

/// Log query direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Backward,
    Forward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Backward => "backward",
            Direction::Forward => "forward",
        }
    }
}

/// Queries against a Loki-compatible log store
#[async_trait]
pub trait LogBackend: Send + Sync {
    async fn query(&self, expr: &str, limit: u32) -> Result<LogQueryData>;

    /// Range query; `start_ns`/`end_ns` in unix nanoseconds
    async fn query_range(
        &self,
        expr: &str,
        start_ns: i64,
        end_ns: i64,
        limit: u32,
        direction: Direction,
    ) -> Result<LogQueryData>;
}

/// Escape a label value for use inside double quotes
pub fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `{profile="..."}` selector, or empty for the "all" profile
pub fn profile_selector(profile: &str) -> String {
    if profile == ALL_PROFILES {
        String::new()
    } else {
        format!("{{profile=\"{}\"}}", escape_label_value(profile))
    }
}

/// Log stream selector for the assistant's service, optionally narrowed to a
/// profile
pub fn log_stream_selector(service: &str, profile: &str) -> String {
    let service = escape_label_value(service);
    if profile == ALL_PROFILES {
        format!("{{service_name=\"{service}\"}}")
    } else {
        format!(
            "{{service_name=\"{service}\", profile=\"{}\"}}",
            escape_label_value(profile)
        )
    }
}

//! Scripted backend and notifier doubles for worker tests

use crate::backend::{
    BackendError, Direction, InstantSeries, InstantVector, LogBackend, LogQueryData,
    MetricsBackend, RangeMatrix,
};
use crate::models::SeriesPoint;
use crate::notify::{Notification, Notifier, NotifyError};
use async_trait::async_trait;
use std::sync::Mutex;

type MetricsHandler = dyn Fn(&str) -> Result<InstantVector, BackendError> + Send + Sync;
type LogsHandler = dyn Fn(&str) -> Result<LogQueryData, BackendError> + Send + Sync;

/// Single-series vector holding `value`
pub fn scalar(value: &str) -> InstantVector {
    InstantVector::new(vec![InstantSeries {
        metric: Default::default(),
        value: SeriesPoint::new(1_700_000_000, value),
    }])
}

/// One series per label set, each with value "1"
pub fn labelled(label: &str, values: &[&str]) -> InstantVector {
    InstantVector::new(
        values
            .iter()
            .map(|v| InstantSeries {
                metric: [(label.to_string(), v.to_string())].into_iter().collect(),
                value: SeriesPoint::new(1_700_000_000, "1"),
            })
            .collect(),
    )
}

pub fn backend_down() -> BackendError {
    BackendError::Api("backend unavailable".into())
}

/// Metrics backend answering every query through a closure
pub struct MockMetrics {
    handler: Box<MetricsHandler>,
    queries: Mutex<Vec<String>>,
}

impl MockMetrics {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Result<InstantVector, BackendError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.queries().iter().filter(|q| q.contains(needle)).count()
    }
}

#[async_trait]
impl MetricsBackend for MockMetrics {
    async fn query(&self, expr: &str) -> Result<InstantVector, BackendError> {
        self.queries.lock().unwrap().push(expr.to_string());
        (self.handler)(expr)
    }

    async fn query_range(
        &self,
        expr: &str,
        _start: i64,
        _end: i64,
        _step: u64,
    ) -> Result<RangeMatrix, BackendError> {
        self.queries.lock().unwrap().push(expr.to_string());
        Ok(Vec::new())
    }
}

/// Log backend answering every query through a closure
pub struct MockLogs {
    handler: Box<LogsHandler>,
    queries: Mutex<Vec<String>>,
}

impl MockLogs {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Result<LogQueryData, BackendError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Every metric query returns `count`
    pub fn constant(count: &str) -> Self {
        let count = count.to_string();
        Self::new(move |_| Ok(LogQueryData::Vector(scalar(&count))))
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogBackend for MockLogs {
    async fn query(&self, expr: &str, _limit: u32) -> Result<LogQueryData, BackendError> {
        self.queries.lock().unwrap().push(expr.to_string());
        (self.handler)(expr)
    }

    async fn query_range(
        &self,
        expr: &str,
        _start_ns: i64,
        _end_ns: i64,
        _limit: u32,
        _direction: Direction,
    ) -> Result<LogQueryData, BackendError> {
        self.queries.lock().unwrap().push(expr.to_string());
        (self.handler)(expr)
    }
}

/// Notifier that records instead of sending
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

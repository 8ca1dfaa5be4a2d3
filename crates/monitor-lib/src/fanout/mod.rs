//! Live log event fan-out
//!
//! A [`LokiTail`] subscription feeds a [`Broadcaster`], which redacts
//! secrets and pushes each batch to every connected stream subscriber.

mod broadcaster;
pub mod sanitizer;
mod tail;

pub use self::broadcaster::{
    Broadcaster, EventBatch, Subscription, DEFAULT_MAX_SUBSCRIBERS, SUBSCRIBER_BUFFER,
};
pub use self::tail::{parse_tail_frame, LokiTail, TailConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fan-out errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FanoutError {
    #[error("subscriber limit of {limit} reached")]
    Capacity { limit: usize },
}

/// One parsed log event
///
/// `timestamp` is the backend's nanosecond timestamp string; every other
/// key comes from the stream labels or the JSON log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

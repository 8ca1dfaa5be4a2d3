//! Bounded fan-out of sanitized event batches to live subscribers

use super::sanitizer::sanitize_event;
use super::{FanoutError, LogEvent};
use crate::observability::MonitorMetrics;
use futures_util::Stream;
use prometheus::IntGauge;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Default subscriber limit
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 50;

/// Batches a subscriber may fall behind before it is disconnected
pub const SUBSCRIBER_BUFFER: usize = 64;

/// One sanitized upstream batch, shared by every subscriber
pub type EventBatch = Arc<Vec<LogEvent>>;

type Sinks = HashMap<u64, mpsc::Sender<EventBatch>>;

struct Inner {
    max_subscribers: usize,
    next_id: AtomicU64,
    sinks: Mutex<Sinks>,
    gauge: IntGauge,
}

impl Inner {
    fn sinks(&self) -> MutexGuard<'_, Sinks> {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish the current count; call with the sink lock held
    fn record(&self, sinks: &Sinks) {
        self.gauge.set(sinks.len() as i64);
    }
}

/// Fan-out broadcaster
///
/// Cheap to clone; clones share the same subscriber set. Each subscriber
/// gets its own bounded queue, so batches reach it in publish order no matter
/// how fast the others drain. A subscriber that lets its queue fill is
/// disconnected rather than buffered without limit.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBSCRIBERS)
    }
}

impl Broadcaster {
    /// Broadcaster reporting its subscriber count to the process metrics
    pub fn new(max_subscribers: usize) -> Self {
        Self::with_gauge(max_subscribers, MonitorMetrics::new().stream_subscribers())
    }

    pub fn with_gauge(max_subscribers: usize, gauge: IntGauge) -> Self {
        gauge.set(0);
        Self {
            inner: Arc::new(Inner {
                max_subscribers,
                next_id: AtomicU64::new(1),
                sinks: Mutex::new(HashMap::new()),
                gauge,
            }),
        }
    }

    /// Register a new subscriber
    ///
    /// # Errors
    /// [`FanoutError::Capacity`] when the subscriber limit is reached
    pub fn subscribe(&self) -> Result<Subscription, FanoutError> {
        let mut sinks = self.inner.sinks();
        if sinks.len() >= self.inner.max_subscribers {
            return Err(FanoutError::Capacity {
                limit: self.inner.max_subscribers,
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        sinks.insert(id, tx);
        self.inner.record(&sinks);
        debug!(subscriber = id, total = sinks.len(), "stream subscriber added");

        Ok(Subscription {
            id,
            rx,
            owner: Arc::downgrade(&self.inner),
        })
    }

    /// Sanitize `events` and deliver them to every live subscriber
    ///
    /// Subscribers that are gone or whose queue is full are dropped from the
    /// set. Returns the number of subscribers the batch reached.
    pub fn publish(&self, events: &[LogEvent]) -> usize {
        if events.is_empty() {
            return 0;
        }
        let batch: EventBatch = Arc::new(events.iter().map(sanitize_event).collect());

        let mut sinks = self.inner.sinks();
        sinks.retain(|id, tx| match tx.try_send(Arc::clone(&batch)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(subscriber = *id, "dropping lagging stream subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = *id, "dropping closed stream subscriber");
                false
            }
        });
        self.inner.record(&sinks);
        sinks.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sinks().len()
    }

    pub fn max_subscribers(&self) -> usize {
        self.inner.max_subscribers
    }
}

/// Receiving side of a subscription; unsubscribes when dropped
///
/// Ends after the buffered batches once the broadcaster is gone or has
/// disconnected this subscriber for lagging.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<EventBatch>,
    owner: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<EventBatch> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = EventBatch;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            let mut sinks = inner.sinks();
            if sinks.remove(&self.id).is_some() {
                inner.record(&sinks);
            }
        }
    }
}

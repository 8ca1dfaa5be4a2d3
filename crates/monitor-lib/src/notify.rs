//! Alert notifications
//!
//! Delivery never blocks a monitoring cycle: the workers hand a
//! [`Notification`] to [`NotificationDispatcher::detach`], which sends it on
//! its own task and reports failures over a dedicated channel.

use crate::models::{NotifyMethod, Severity};
use crate::observability::{MonitorMetrics, StructuredLogger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Footer shown on Slack attachments
const SLACK_FOOTER: &str = "Loggist";

/// One outgoing notification
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: NotifyMethod,
    pub target: Option<String>,
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{0} notification requires a target URL")]
    MissingTarget(NotifyMethod),

    #[error("notification request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("notification endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Delivers a single notification
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Slack incoming-webhook body
pub fn slack_payload(n: &Notification, now: DateTime<Utc>) -> Value {
    let (emoji, color) = match n.severity {
        Severity::Info => (":information_source:", "good"),
        Severity::Warning => (":warning:", "warning"),
        Severity::Critical => (":rotating_light:", "danger"),
    };
    json!({
        "text": format!("{emoji} *{}*", n.title),
        "attachments": [{
            "color": color,
            "text": n.message,
            "footer": SLACK_FOOTER,
            "ts": now.timestamp(),
        }],
    })
}

/// Generic webhook body
pub fn webhook_payload(n: &Notification, now: DateTime<Utc>) -> Value {
    json!({
        "title": n.title,
        "message": n.message,
        "severity": n.severity,
        "timestamp": now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    })
}

/// Notifier posting JSON to Slack or a generic webhook
///
/// Dashboard notifications are a no-op; the stored row is what the UI shows.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
}

impl HttpNotifier {
    pub fn new() -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(NOTIFY_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        let body = match n.method {
            NotifyMethod::Dashboard => return Ok(()),
            NotifyMethod::Slack => slack_payload(n, Utc::now()),
            NotifyMethod::Webhook => webhook_payload(n, Utc::now()),
        };
        let url = n
            .target
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(NotifyError::MissingTarget(n.method))?;

        let response = self.client.post(url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status, body });
        }
        debug!(method = %n.method, title = %n.title, "Notification delivered");
        Ok(())
    }
}

/// A notification that could not be delivered
#[derive(Debug)]
pub struct NotifyFailure {
    pub notification: Notification,
    pub error: NotifyError,
}

/// Spawns deliveries off the caller's path
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    failures: mpsc::UnboundedSender<NotifyFailure>,
}

impl NotificationDispatcher {
    /// Dispatcher plus the receiving end of its failure channel
    pub fn new(notifier: Arc<dyn Notifier>) -> (Self, mpsc::UnboundedReceiver<NotifyFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        (Self { notifier, failures }, rx)
    }

    /// Send `notification` on its own task
    pub fn detach(&self, notification: Notification) -> JoinHandle<()> {
        self.spawn_send(notification, None::<fn()>)
    }

    /// Send `notification` on its own task and, only if delivery succeeded,
    /// run `on_delivered` on the blocking pool. Store writes belong here.
    pub fn detach_then<F>(&self, notification: Notification, on_delivered: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_send(notification, Some(on_delivered))
    }

    fn spawn_send<F>(&self, notification: Notification, on_delivered: Option<F>) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let notifier = Arc::clone(&self.notifier);
        let failures = self.failures.clone();
        tokio::spawn(async move {
            match notifier.notify(&notification).await {
                Ok(()) => {
                    if let Some(callback) = on_delivered {
                        if let Err(e) = tokio::task::spawn_blocking(callback).await {
                            warn!(error = %e, title = %notification.title, "Delivery callback failed");
                        }
                    }
                }
                Err(error) => {
                    // Receiver gone means shutdown; nothing left to report to
                    let _ = failures.send(NotifyFailure {
                        notification,
                        error,
                    });
                }
            }
        })
    }
}

/// Log and count every failure until all dispatchers are dropped
pub async fn drain_failures(
    mut rx: mpsc::UnboundedReceiver<NotifyFailure>,
    logger: StructuredLogger,
    metrics: MonitorMetrics,
) {
    while let Some(failure) = rx.recv().await {
        let method = failure.notification.method.as_str();
        metrics.inc_notifications_failed(method);
        logger.log_notification_failure(
            method,
            &failure.notification.title,
            &failure.error.to_string(),
        );
    }
}

//! Relational store for budgets, alerts, signal events and settings

mod sqlite;

pub use self::sqlite::SqliteStore;

use crate::models::{
    Budget, BudgetAlert, NewBudget, NewBudgetAlert, NewSignalEvent, SignalEvent, UnknownVariant,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid row: {0}")]
    InvalidRow(#[from] UnknownVariant),

    #[error("{0} not found")]
    NotFound(String),

    #[error("could not create database directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Filter for listing signal events
#[derive(Debug, Clone, Default)]
pub struct SignalEventFilter {
    pub rule_id: Option<String>,
    pub acknowledged: Option<bool>,
    pub limit: Option<u32>,
}

/// Storage used by the monitoring workers and the route layer
///
/// Every write is a single statement. Dedup checks and the inserts that
/// follow them are separate calls; callers accept that check-then-insert is
/// best effort.
pub trait MonitorStore: Send + Sync {
    fn list_budgets(&self) -> Result<Vec<Budget>>;
    fn get_budget(&self, id: i64) -> Result<Budget>;
    fn insert_budget(&self, budget: &NewBudget) -> Result<Budget>;
    fn delete_budget(&self, id: i64) -> Result<bool>;

    /// Whether an alert for `(budget_id, threshold_pct)` fired at or after `since`
    fn has_recent_budget_alert(
        &self,
        budget_id: i64,
        threshold_pct: i64,
        since: DateTime<Utc>,
    ) -> Result<bool>;
    fn insert_budget_alert(&self, alert: &NewBudgetAlert) -> Result<i64>;
    fn mark_budget_alert_notified(&self, id: i64) -> Result<()>;
    fn list_budget_alerts(&self, budget_id: Option<i64>, limit: u32) -> Result<Vec<BudgetAlert>>;

    /// Whether an unacknowledged event for `(rule_id, profile)` fired at or
    /// after `since`
    fn has_recent_signal_event(
        &self,
        rule_id: &str,
        profile: &str,
        since: DateTime<Utc>,
    ) -> Result<bool>;
    fn insert_signal_event(&self, event: &NewSignalEvent) -> Result<i64>;
    fn get_signal_event(&self, id: i64) -> Result<SignalEvent>;
    /// Newest first
    fn list_signal_events(&self, filter: &SignalEventFilter) -> Result<Vec<SignalEvent>>;
    fn acknowledge_signal_event(&self, id: i64) -> Result<bool>;
    /// Returns the number of rows removed
    fn delete_signal_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn put_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Setting holding the default webhook for signal notifications
pub const SETTING_NOTIFY_WEBHOOK_URL: &str = "notify_webhook_url";

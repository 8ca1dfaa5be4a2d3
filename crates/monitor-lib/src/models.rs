//! Core data models for the monitoring engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Profile value meaning "no profile filter"
pub const ALL_PROFILES: &str = "all";

/// Budget period, which also fixes the spend query window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    /// Length of the trailing window spend is measured over
    pub fn window(&self) -> Duration {
        match self {
            BudgetPeriod::Daily => Duration::from_secs(24 * 60 * 60),
            BudgetPeriod::Weekly => Duration::from_secs(7 * 24 * 60 * 60),
            BudgetPeriod::Monthly => Duration::from_secs(30 * 24 * 60 * 60),
        }
    }

    /// Window as a PromQL range literal
    pub fn range_literal(&self) -> &'static str {
        match self {
            BudgetPeriod::Daily => "24h",
            BudgetPeriod::Weekly => "7d",
            BudgetPeriod::Monthly => "30d",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetPeriod::Daily => "daily",
            BudgetPeriod::Weekly => "weekly",
            BudgetPeriod::Monthly => "monthly",
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BudgetPeriod {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(BudgetPeriod::Daily),
            "weekly" => Ok(BudgetPeriod::Weekly),
            "monthly" => Ok(BudgetPeriod::Monthly),
            other => Err(UnknownVariant::new("budget period", other)),
        }
    }
}

/// How an alert is delivered beyond the dashboard row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyMethod {
    Dashboard,
    Slack,
    Webhook,
}

impl NotifyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyMethod::Dashboard => "dashboard",
            NotifyMethod::Slack => "slack",
            NotifyMethod::Webhook => "webhook",
        }
    }
}

impl fmt::Display for NotifyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotifyMethod {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dashboard" => Ok(NotifyMethod::Dashboard),
            "slack" => Ok(NotifyMethod::Slack),
            "webhook" => Ok(NotifyMethod::Webhook),
            other => Err(UnknownVariant::new("notify method", other)),
        }
    }
}

/// Severity attached to notifications and signal rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A string column held a value outside the enum's domain
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Spend budget configured through the route layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: i64,
    /// Profile filter, or "all"
    pub profile: String,
    pub period: BudgetPeriod,
    pub amount_usd: f64,
    /// Custom alert threshold in percent of `amount_usd`
    pub alert_threshold_pct: i64,
    pub notify_method: NotifyMethod,
    pub notify_url: Option<String>,
}

/// Input for creating a budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBudget {
    pub profile: String,
    pub period: BudgetPeriod,
    pub amount_usd: f64,
    pub alert_threshold_pct: i64,
    pub notify_method: NotifyMethod,
    pub notify_url: Option<String>,
}

impl Default for NewBudget {
    fn default() -> Self {
        Self {
            profile: ALL_PROFILES.to_string(),
            period: BudgetPeriod::Monthly,
            amount_usd: 0.0,
            alert_threshold_pct: 80,
            notify_method: NotifyMethod::Dashboard,
            notify_url: None,
        }
    }
}

/// A threshold crossing recorded by the budget monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub id: i64,
    pub budget_id: i64,
    pub triggered_at: DateTime<Utc>,
    pub current_amount_usd: f64,
    pub threshold_pct: i64,
    pub notified: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBudgetAlert {
    pub budget_id: i64,
    pub triggered_at: DateTime<Utc>,
    pub current_amount_usd: f64,
    pub threshold_pct: i64,
}

/// A persisted signal rule firing
///
/// `data` is the rule's evidence as JSON; see `signals::Evidence` for the
/// typed view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub id: i64,
    pub rule_id: String,
    pub profile: String,
    pub fired_at: DateTime<Utc>,
    pub data: String,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSignalEvent {
    pub rule_id: String,
    pub profile: String,
    pub fired_at: DateTime<Utc>,
    pub data: String,
}

/// One sample of a time series: unix seconds and the backend's string value
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: i64,
    pub value: String,
}

impl SeriesPoint {
    pub fn new(timestamp: i64, value: impl Into<String>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    /// Numeric value; NaN when the backend sent something unparseable
    pub fn numeric(&self) -> f64 {
        self.value.parse().unwrap_or(f64::NAN)
    }
}

// Backends encode samples as `[<float seconds>, "<value>"]`.
impl<'de> Deserialize<'de> for SeriesPoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (timestamp, value) = <(f64, String)>::deserialize(deserializer)?;
        Ok(SeriesPoint {
            timestamp: timestamp as i64,
            value,
        })
    }
}

impl Serialize for SeriesPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.timestamp, &self.value).serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_windows() {
        assert_eq!(BudgetPeriod::Daily.window(), Duration::from_secs(86_400));
        assert_eq!(BudgetPeriod::Weekly.range_literal(), "7d");
        assert_eq!(BudgetPeriod::Monthly.range_literal(), "30d");
    }

    #[test]
    fn test_enum_round_trip_through_str() {
        assert_eq!("weekly".parse::<BudgetPeriod>(), Ok(BudgetPeriod::Weekly));
        assert_eq!("slack".parse::<NotifyMethod>(), Ok(NotifyMethod::Slack));
        assert!("yearly".parse::<BudgetPeriod>().is_err());
    }

    #[test]
    fn test_series_point_wire_format() {
        let point: SeriesPoint = serde_json::from_str(r#"[1712345678.25, "1.5"]"#).unwrap();
        assert_eq!(point.timestamp, 1_712_345_678);
        assert_eq!(point.numeric(), 1.5);
        assert_eq!(serde_json::to_string(&point).unwrap(), r#"[1712345678,"1.5"]"#);
    }

    #[test]
    fn test_unparseable_value_is_nan() {
        assert!(SeriesPoint::new(1, "oops").numeric().is_nan());
    }
}

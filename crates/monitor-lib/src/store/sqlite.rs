//! SQLite implementation of [`MonitorStore`]

use super::{MonitorStore, Result, SignalEventFilter, StoreError};
use crate::models::{
    Budget, BudgetAlert, NewBudget, NewBudgetAlert, NewSignalEvent, SignalEvent,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS budgets (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    profile             TEXT    NOT NULL DEFAULT 'all',
    period              TEXT    NOT NULL,
    amount_usd          REAL    NOT NULL,
    alert_threshold_pct INTEGER NOT NULL DEFAULT 80,
    notify_method       TEXT    NOT NULL DEFAULT 'dashboard',
    notify_url          TEXT,
    created_at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS budget_alerts (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    budget_id          INTEGER NOT NULL REFERENCES budgets(id) ON DELETE CASCADE,
    triggered_at       INTEGER NOT NULL,
    current_amount_usd REAL    NOT NULL,
    threshold_pct      INTEGER NOT NULL,
    notified           INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_budget_alerts_lookup
    ON budget_alerts (budget_id, threshold_pct, triggered_at);

CREATE TABLE IF NOT EXISTS signal_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id      TEXT    NOT NULL,
    profile      TEXT    NOT NULL,
    fired_at     INTEGER NOT NULL,
    data         TEXT    NOT NULL DEFAULT '{}',
    acknowledged INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_signal_events_lookup
    ON signal_events (rule_id, profile, fired_at);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Single-connection SQLite store
///
/// The monitoring workers issue a handful of statements per tick, so one
/// serialized connection is enough.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        info!(path = %path.display(), "opened sqlite store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn to_ts(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Budget row with its enum columns still as text
struct BudgetRow {
    id: i64,
    profile: String,
    period: String,
    amount_usd: f64,
    alert_threshold_pct: i64,
    notify_method: String,
    notify_url: Option<String>,
}

fn row_to_budget(row: &Row) -> rusqlite::Result<BudgetRow> {
    Ok(BudgetRow {
        id: row.get("id")?,
        profile: row.get("profile")?,
        period: row.get("period")?,
        amount_usd: row.get("amount_usd")?,
        alert_threshold_pct: row.get("alert_threshold_pct")?,
        notify_method: row.get("notify_method")?,
        notify_url: row.get("notify_url")?,
    })
}

impl TryFrom<BudgetRow> for Budget {
    type Error = StoreError;

    fn try_from(row: BudgetRow) -> Result<Self> {
        Ok(Budget {
            id: row.id,
            profile: row.profile,
            period: row.period.parse()?,
            amount_usd: row.amount_usd,
            alert_threshold_pct: row.alert_threshold_pct,
            notify_method: row.notify_method.parse()?,
            notify_url: row.notify_url,
        })
    }
}

fn row_to_alert(row: &Row) -> rusqlite::Result<BudgetAlert> {
    Ok(BudgetAlert {
        id: row.get("id")?,
        budget_id: row.get("budget_id")?,
        triggered_at: from_ts(row.get("triggered_at")?),
        current_amount_usd: row.get("current_amount_usd")?,
        threshold_pct: row.get("threshold_pct")?,
        notified: row.get::<_, i64>("notified")? != 0,
    })
}

fn row_to_event(row: &Row) -> rusqlite::Result<SignalEvent> {
    Ok(SignalEvent {
        id: row.get("id")?,
        rule_id: row.get("rule_id")?,
        profile: row.get("profile")?,
        fired_at: from_ts(row.get("fired_at")?),
        data: row.get("data")?,
        acknowledged: row.get::<_, i64>("acknowledged")? != 0,
    })
}

fn not_found(what: String) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(what),
        other => StoreError::Sqlite(other),
    }
}

impl MonitorStore for SqliteStore {
    fn list_budgets(&self) -> Result<Vec<Budget>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM budgets ORDER BY id")?;
        let rows = stmt.query_map([], row_to_budget)?;
        rows.map(|r| Budget::try_from(r?)).collect()
    }

    fn get_budget(&self, id: i64) -> Result<Budget> {
        let raw = self
            .conn()
            .query_row(
                "SELECT * FROM budgets WHERE id = ?1",
                params![id],
                row_to_budget,
            )
            .map_err(not_found(format!("budget {id}")))?;
        Budget::try_from(raw)
    }

    fn insert_budget(&self, budget: &NewBudget) -> Result<Budget> {
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO budgets (profile, period, amount_usd, alert_threshold_pct,
                                      notify_method, notify_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    budget.profile,
                    budget.period.as_str(),
                    budget.amount_usd,
                    budget.alert_threshold_pct,
                    budget.notify_method.as_str(),
                    budget.notify_url,
                    to_ts(Utc::now()),
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.get_budget(id)
    }

    fn delete_budget(&self, id: i64) -> Result<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM budgets WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    fn has_recent_budget_alert(
        &self,
        budget_id: i64,
        threshold_pct: i64,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM budget_alerts
                 WHERE budget_id = ?1 AND threshold_pct = ?2 AND triggered_at >= ?3
                 LIMIT 1",
                params![budget_id, threshold_pct, to_ts(since)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_budget_alert(&self, alert: &NewBudgetAlert) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO budget_alerts (budget_id, triggered_at, current_amount_usd, threshold_pct)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                alert.budget_id,
                to_ts(alert.triggered_at),
                alert.current_amount_usd,
                alert.threshold_pct,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn mark_budget_alert_notified(&self, id: i64) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE budget_alerts SET notified = 1 WHERE id = ?1",
            params![id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("budget alert {id}")));
        }
        Ok(())
    }

    fn list_budget_alerts(&self, budget_id: Option<i64>, limit: u32) -> Result<Vec<BudgetAlert>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM budget_alerts
             WHERE (?1 IS NULL OR budget_id = ?1)
             ORDER BY triggered_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![budget_id, limit], row_to_alert)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn has_recent_signal_event(
        &self,
        rule_id: &str,
        profile: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM signal_events
                 WHERE rule_id = ?1 AND profile = ?2 AND fired_at >= ?3 AND acknowledged = 0
                 LIMIT 1",
                params![rule_id, profile, to_ts(since)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_signal_event(&self, event: &NewSignalEvent) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO signal_events (rule_id, profile, fired_at, data)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.rule_id,
                event.profile,
                to_ts(event.fired_at),
                event.data,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_signal_event(&self, id: i64) -> Result<SignalEvent> {
        self.conn()
            .query_row(
                "SELECT * FROM signal_events WHERE id = ?1",
                params![id],
                row_to_event,
            )
            .map_err(not_found(format!("signal event {id}")))
    }

    fn list_signal_events(&self, filter: &SignalEventFilter) -> Result<Vec<SignalEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM signal_events
             WHERE (?1 IS NULL OR rule_id = ?1)
               AND (?2 IS NULL OR acknowledged = ?2)
             ORDER BY fired_at DESC, id DESC
             LIMIT ?3",
        )?;
        let limit = filter.limit.map(i64::from).unwrap_or(-1);
        let rows = stmt.query_map(
            params![filter.rule_id, filter.acknowledged, limit],
            row_to_event,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn acknowledge_signal_event(&self, id: i64) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE signal_events SET acknowledged = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(n > 0)
    }

    fn delete_signal_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(self.conn().execute(
            "DELETE FROM signal_events WHERE fired_at < ?1",
            params![to_ts(cutoff)],
        )?)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BudgetPeriod, NotifyMethod};
    use chrono::Duration;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn budget(store: &SqliteStore) -> Budget {
        store
            .insert_budget(&NewBudget {
                profile: "team-a".into(),
                period: BudgetPeriod::Weekly,
                amount_usd: 100.0,
                notify_method: NotifyMethod::Slack,
                notify_url: Some("https://hooks.example/x".into()),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_budget_crud() {
        let store = store();
        let created = budget(&store);

        assert_eq!(created.period, BudgetPeriod::Weekly);
        assert_eq!(created.notify_method, NotifyMethod::Slack);
        assert_eq!(created.alert_threshold_pct, 80);
        assert_eq!(store.list_budgets().unwrap(), vec![created.clone()]);

        assert!(store.delete_budget(created.id).unwrap());
        assert!(!store.delete_budget(created.id).unwrap());
        assert!(matches!(
            store.get_budget(created.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_unknown_period_in_row_is_rejected() {
        let store = store();
        store
            .conn()
            .execute(
                "INSERT INTO budgets (period, amount_usd, created_at) VALUES ('yearly', 1, 0)",
                [],
            )
            .unwrap();
        assert!(matches!(
            store.list_budgets(),
            Err(StoreError::InvalidRow(_))
        ));
    }

    #[test]
    fn test_recent_budget_alert_window() {
        let store = store();
        let b = budget(&store);
        let now = Utc::now();

        assert!(!store
            .has_recent_budget_alert(b.id, 80, now - Duration::days(1))
            .unwrap());

        let id = store
            .insert_budget_alert(&NewBudgetAlert {
                budget_id: b.id,
                triggered_at: now - Duration::hours(2),
                current_amount_usd: 85.0,
                threshold_pct: 80,
            })
            .unwrap();

        assert!(store
            .has_recent_budget_alert(b.id, 80, now - Duration::days(1))
            .unwrap());
        assert!(!store
            .has_recent_budget_alert(b.id, 100, now - Duration::days(1))
            .unwrap());
        assert!(!store
            .has_recent_budget_alert(b.id, 80, now - Duration::hours(1))
            .unwrap());

        store.mark_budget_alert_notified(id).unwrap();
        let alerts = store.list_budget_alerts(Some(b.id), 10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].notified);
        assert_eq!(alerts[0].current_amount_usd, 85.0);
    }

    #[test]
    fn test_deleting_budget_cascades_to_alerts() {
        let store = store();
        let b = budget(&store);
        store
            .insert_budget_alert(&NewBudgetAlert {
                budget_id: b.id,
                triggered_at: Utc::now(),
                current_amount_usd: 120.0,
                threshold_pct: 100,
            })
            .unwrap();

        store.delete_budget(b.id).unwrap();
        assert!(store.list_budget_alerts(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_signal_dedup_ignores_acknowledged() {
        let store = store();
        let now = Utc::now();
        let id = store
            .insert_signal_event(&NewSignalEvent {
                rule_id: "cost_spike".into(),
                profile: "all".into(),
                fired_at: now - Duration::minutes(10),
                data: "{}".into(),
            })
            .unwrap();

        let since = now - Duration::hours(1);
        assert!(store.has_recent_signal_event("cost_spike", "all", since).unwrap());
        assert!(!store.has_recent_signal_event("cost_spike", "ops", since).unwrap());

        assert!(store.acknowledge_signal_event(id).unwrap());
        assert!(!store.has_recent_signal_event("cost_spike", "all", since).unwrap());
        assert!(store.get_signal_event(id).unwrap().acknowledged);
    }

    #[test]
    fn test_list_and_purge_signal_events() {
        let store = store();
        let now = Utc::now();
        for (rule, age_days) in [("cost_spike", 40), ("cost_spike", 1), ("api_error_burst", 0)] {
            store
                .insert_signal_event(&NewSignalEvent {
                    rule_id: rule.into(),
                    profile: "all".into(),
                    fired_at: now - Duration::days(age_days),
                    data: "{}".into(),
                })
                .unwrap();
        }

        let all = store.list_signal_events(&SignalEventFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].rule_id, "api_error_burst");

        let spikes = store
            .list_signal_events(&SignalEventFilter {
                rule_id: Some("cost_spike".into()),
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(spikes.len(), 1);

        let removed = store
            .delete_signal_events_before(now - Duration::days(30))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store.list_signal_events(&SignalEventFilter::default()).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_settings_upsert() {
        let store = store();
        assert_eq!(store.get_setting("notify_webhook_url").unwrap(), None);
        store.put_setting("notify_webhook_url", "a").unwrap();
        store.put_setting("notify_webhook_url", "b").unwrap();
        assert_eq!(
            store.get_setting("notify_webhook_url").unwrap().as_deref(),
            Some("b")
        );
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("loggist.db");
        let store = SqliteStore::open(&path).unwrap();
        store.put_setting("k", "v").unwrap();
        assert!(path.exists());
    }
}

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::info;

/// Handle on the durable relational store.
///
/// Each operation opens a short-lived connection against the shared database
/// file, so cron drivers and workers in separate processes coordinate purely
/// through SQLite transactions (WAL mode, busy timeout). Claim sequences that
/// must be atomic run inside [`Store::with_tx`].
#[derive(Clone)]
pub struct Store {
    path: String,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flows (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id        INTEGER NOT NULL,
    name          TEXT NOT NULL,
    flow_type     TEXT NOT NULL DEFAULT 'M',
    is_archived   INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS flow_starts (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id            INTEGER NOT NULL,
    flow_id           INTEGER NOT NULL,
    start_type        TEXT NOT NULL,
    flow_type         TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'P',
    contact_count     INTEGER,
    batch_count       INTEGER NOT NULL DEFAULT 0,
    completed_batches INTEGER NOT NULL DEFAULT 0,
    created_by_id     INTEGER,
    spec              TEXT NOT NULL,
    created_on        TEXT NOT NULL,
    modified_on       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS flow_start_contacts (
    flowstart_id  INTEGER NOT NULL,
    contact_id    INTEGER NOT NULL,
    entered       INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (flowstart_id, contact_id)
);
CREATE TABLE IF NOT EXISTS schedules (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id         INTEGER NOT NULL,
    is_active      INTEGER NOT NULL DEFAULT 1,
    repeat_period  TEXT NOT NULL DEFAULT 'O',
    next_fire      TEXT,
    last_fire      TEXT
);
CREATE TABLE IF NOT EXISTS schedule_triggers (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id       INTEGER NOT NULL,
    schedule_id  INTEGER NOT NULL,
    flow_id      INTEGER NOT NULL,
    contact_ids  TEXT NOT NULL DEFAULT '[]',
    group_ids    TEXT NOT NULL DEFAULT '[]',
    is_archived  INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS broadcasts (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id         INTEGER NOT NULL,
    parent_id      INTEGER,
    schedule_id    INTEGER,
    status         TEXT NOT NULL DEFAULT 'Q',
    base_language  TEXT NOT NULL,
    translations   TEXT NOT NULL,
    contact_ids    TEXT NOT NULL DEFAULT '[]',
    group_ids      TEXT NOT NULL DEFAULT '[]',
    created_on     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS campaign_events (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id   INTEGER NOT NULL,
    flow_id  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS event_fires (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id    INTEGER NOT NULL,
    contact_id  INTEGER NOT NULL,
    scheduled   TEXT NOT NULL,
    fired       TEXT
);
CREATE INDEX IF NOT EXISTS idx_event_fires_due ON event_fires(scheduled) WHERE fired IS NULL;
CREATE TABLE IF NOT EXISTS locks (
    name        TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    expires_on  TEXT NOT NULL
);
"#;

impl Store {
    /// Open or create the store at the given path and initialize the schema.
    pub fn open(path: &str) -> Result<Self> {
        let store = Self { path: path.to_string() };
        let conn = store.conn()?;
        conn.execute_batch(SCHEMA).context("initializing store schema")?;
        info!(path = %path, "store opened");
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).context("opening store connection")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(conn)
    }

    /// Run `f` inside a single immediate transaction, committing on Ok and
    /// rolling back on Err. All claim + create sequences go through here.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("beginning transaction")?;
        let value = f(&tx)?;
        tx.commit().context("committing transaction")?;
        Ok(value)
    }
}

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that SQL string
/// comparison orders them correctly.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid stored timestamp '{s}'"))?
        .with_timezone(&Utc))
}

#[cfg(test)]
pub(crate) fn test_store() -> Store {
    let path = std::env::temp_dir().join(format!("flowline-test-{}.db", uuid::Uuid::new_v4()));
    Store::open(path.to_str().unwrap()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_is_reentrant() {
        let store = test_store();
        // A second open against the same path must not clobber existing data.
        let again = Store::open(store.path()).unwrap();
        assert_eq!(again.path(), store.path());
    }

    #[test]
    fn test_timestamp_text_ordering() {
        let base = Utc::now();
        let earlier = ts(base - chrono::Duration::seconds(1));
        let later = ts(base);
        assert!(earlier < later);
        assert_eq!(parse_ts(&later).unwrap(), parse_ts(&ts(base)).unwrap());
    }

    #[test]
    fn test_with_tx_rolls_back_on_error() {
        let store = test_store();
        let result: Result<()> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO flows (org_id, name, flow_type) VALUES (1, 'favorites', 'M')",
                [],
            )?;
            anyhow::bail!("boom")
        });
        assert!(result.is_err());

        let count: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT count(*) FROM flows", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}

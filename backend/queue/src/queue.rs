use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use flowline_core::{OrgID, Priority, Task};

/// Default visibility timeout: a popped task that is not acked within this
/// window is considered abandoned and becomes poppable again.
const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// How often a waiting pop re-checks the table for work pushed by other
/// processes or freed by lease expiry.
const WAIT_POLL: Duration = Duration::from_secs(1);

/// At-least-once work queue backed by the same SQLite file as the store, so
/// pushes can join store transactions.
///
/// Delivery order is priority first, then fair round-robin across
/// organizations, then FIFO within an organization. A popped task is leased;
/// `ack` removes it, a crashed worker's lease simply expires.
#[derive(Clone)]
pub struct Queue {
    path: String,
    notify: Arc<Notify>,
    lease: Duration,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queued_tasks (
    id            TEXT PRIMARY KEY,
    queue         TEXT NOT NULL,
    org_id        INTEGER NOT NULL,
    task_type     TEXT NOT NULL,
    payload       TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 5,
    queued_on     TEXT NOT NULL,
    attempts      INTEGER NOT NULL DEFAULT 0,
    leased_until  TEXT
);
CREATE INDEX IF NOT EXISTS idx_queued_tasks_ready ON queued_tasks(queue, org_id, priority, queued_on);
CREATE TABLE IF NOT EXISTS queue_cursors (
    queue        TEXT PRIMARY KEY,
    last_org_id  INTEGER NOT NULL
);
"#;

impl Queue {
    pub fn open(path: &str) -> Result<Self> {
        let queue = Self {
            path: path.to_string(),
            notify: Arc::new(Notify::new()),
            lease: DEFAULT_LEASE,
        };
        queue.conn()?.execute_batch(SCHEMA).context("initializing queue schema")?;
        Ok(queue)
    }

    /// Override the visibility timeout (tests use very short leases).
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).context("opening queue connection")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(conn)
    }

    /// Enqueue a task on its own connection.
    pub fn push(
        &self,
        queue: &str,
        task_type: &str,
        org_id: OrgID,
        payload: &serde_json::Value,
        priority: Priority,
    ) -> Result<Uuid> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = self.push_tx(&tx, queue, task_type, org_id, payload, priority)?;
        tx.commit().context("committing push")?;
        Ok(id)
    }

    /// Enqueue inside a caller-owned transaction, so "mark starting" and
    /// "batches are on the queue" commit or roll back together.
    pub fn push_tx(
        &self,
        tx: &Transaction,
        queue: &str,
        task_type: &str,
        org_id: OrgID,
        payload: &serde_json::Value,
        priority: Priority,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO queued_tasks (id, queue, org_id, task_type, payload, priority, queued_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                queue,
                org_id.0,
                task_type,
                payload.to_string(),
                priority.weight(),
                ts(Utc::now()),
            ],
        )
        .context("enqueueing task")?;
        self.notify.notify_waiters();
        tracing::debug!(task_id = %id, queue, task_type, org_id = %org_id, "task queued");
        Ok(id)
    }

    /// Claim the next ready task, or None when the queue is drained.
    pub fn pop(&self, queue: &str) -> Result<Option<Task>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = ts(Utc::now());

        let mut stmt = tx.prepare(
            "SELECT DISTINCT org_id FROM queued_tasks
             WHERE queue = ?1 AND (leased_until IS NULL OR leased_until < ?2)
             ORDER BY org_id",
        )?;
        let orgs = stmt
            .query_map(params![queue, now], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("listing ready orgs")?;
        drop(stmt);
        if orgs.is_empty() {
            return Ok(None);
        }

        // fair routing: resume after the org served on the previous pop
        let cursor: Option<i64> = tx
            .query_row(
                "SELECT last_org_id FROM queue_cursors WHERE queue = ?1",
                params![queue],
                |row| row.get(0),
            )
            .optional()?;
        let org = cursor
            .and_then(|c| orgs.iter().copied().find(|o| *o > c))
            .unwrap_or(orgs[0]);

        let row = tx
            .query_row(
                "SELECT id, task_type, payload, queued_on, attempts FROM queued_tasks
                 WHERE queue = ?1 AND org_id = ?2 AND (leased_until IS NULL OR leased_until < ?3)
                 ORDER BY priority, queued_on, id LIMIT 1",
                params![queue, org, now],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .context("selecting next task")?;
        let Some((id, task_type, payload, queued_on, attempts)) = row else {
            return Ok(None);
        };

        let lease = chrono::Duration::from_std(self.lease).context("lease out of range")?;
        let leased_until = ts(Utc::now() + lease);
        tx.execute(
            "UPDATE queued_tasks SET leased_until = ?1, attempts = attempts + 1 WHERE id = ?2",
            params![leased_until, id],
        )
        .context("leasing task")?;
        tx.execute(
            "INSERT INTO queue_cursors (queue, last_org_id) VALUES (?1, ?2)
             ON CONFLICT(queue) DO UPDATE SET last_org_id = excluded.last_org_id",
            params![queue, org],
        )
        .context("advancing org cursor")?;
        tx.commit().context("committing pop")?;

        Ok(Some(Task {
            id: Uuid::parse_str(&id).context("invalid task id")?,
            task_type,
            org_id: OrgID(org),
            task: serde_json::from_str(&payload).context("decoding task payload")?,
            queued_on: chrono::DateTime::parse_from_rfc3339(&queued_on)
                .context("invalid queued_on")?
                .with_timezone(&Utc),
            attempts: (attempts + 1) as u32,
        }))
    }

    /// Pop with a bounded wait: parks on the queue's notifier (woken by local
    /// pushes) with a coarse poll for cross-process work, and gives up after
    /// `timeout`.
    pub async fn pop_wait(&self, queue: &str, timeout: Duration) -> Result<Option<Task>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.pop(queue)? {
                return Ok(Some(task));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = WAIT_POLL.min(deadline - now);
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    /// Acknowledge a completed task, removing it permanently.
    pub fn ack(&self, id: Uuid) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM queued_tasks WHERE id = ?1", params![id.to_string()])
            .context("acking task")?;
        Ok(())
    }

    /// Number of tasks (leased or not) currently on the named queue.
    pub fn size(&self, queue: &str) -> Result<i64> {
        self.conn()?
            .query_row(
                "SELECT count(*) FROM queued_tasks WHERE queue = ?1",
                params![queue],
                |row| row.get(0),
            )
            .context("sizing queue")
    }
}

fn ts(t: chrono::DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

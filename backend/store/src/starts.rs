use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};

use flowline_core::{ContactID, FlowID, FlowType, OrgID, StartID, StartStatus, StartType, UserID};

use crate::store::{ts, Store};

/// A flow definition known to this deployment, enough to validate starts and
/// pick the batch task type. The catalog itself is synced from outside.
#[derive(Debug, Clone)]
pub struct FlowRow {
    pub id: FlowID,
    pub org_id: OrgID,
    pub name: String,
    pub flow_type: FlowType,
    pub is_archived: bool,
}

/// Status columns of a start row; the immutable spec is stored separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartStatusInfo {
    pub status: StartStatus,
    pub contact_count: Option<i64>,
}

impl Store {
    pub fn insert_flow(&self, org_id: OrgID, name: &str, flow_type: FlowType) -> Result<FlowID> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO flows (org_id, name, flow_type) VALUES (?1, ?2, ?3)",
            params![org_id.0, name, flow_type.as_str()],
        )
        .context("inserting flow")?;
        Ok(FlowID(conn.last_insert_rowid()))
    }

    pub fn get_flow(&self, id: FlowID) -> Result<Option<FlowRow>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, org_id, name, flow_type, is_archived FROM flows WHERE id = ?1",
            params![id.0],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()
        .context("loading flow")?
        .map(|(id, org_id, name, flow_type, is_archived)| {
            Ok(FlowRow {
                id: FlowID(id),
                org_id: OrgID(org_id),
                name,
                flow_type: FlowType::parse(&flow_type)
                    .with_context(|| format!("unknown flow type '{flow_type}'"))?,
                is_archived: is_archived != 0,
            })
        })
        .transpose()
    }

    pub fn set_flow_archived(&self, id: FlowID, archived: bool) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE flows SET is_archived = ?1 WHERE id = ?2",
                params![archived as i64, id.0],
            )
            .context("archiving flow")?;
        Ok(())
    }

    /// Insert a start row in pending status. `spec` is the immutable JSON
    /// recipient specification; it never changes after this write.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_start_tx(
        &self,
        tx: &Transaction,
        org_id: OrgID,
        flow_id: FlowID,
        start_type: StartType,
        flow_type: FlowType,
        created_by_id: Option<UserID>,
        spec: &str,
    ) -> Result<StartID> {
        let now = ts(Utc::now());
        tx.execute(
            "INSERT INTO flow_starts
               (org_id, flow_id, start_type, flow_type, status, created_by_id, spec, created_on, modified_on)
             VALUES (?1, ?2, ?3, ?4, 'P', ?5, ?6, ?7, ?7)",
            params![
                org_id.0,
                flow_id.0,
                start_type.as_str(),
                flow_type.as_str(),
                created_by_id.map(|u| u.0),
                spec,
                now,
            ],
        )
        .context("inserting flow start")?;
        Ok(StartID(tx.last_insert_rowid()))
    }

    pub fn get_start_spec(&self, id: StartID) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT spec FROM flow_starts WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()
            .context("loading start spec")
    }

    pub fn start_status(&self, id: StartID) -> Result<Option<StartStatusInfo>> {
        self.conn()?
            .query_row(
                "SELECT status, contact_count FROM flow_starts WHERE id = ?1",
                params![id.0],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()
            .context("loading start status")?
            .map(|(status, contact_count)| {
                Ok(StartStatusInfo {
                    status: StartStatus::parse(&status)
                        .with_context(|| format!("unknown start status '{status}'"))?,
                    contact_count,
                })
            })
            .transpose()
    }

    /// Claim the pending -> starting transition, recording the resolved
    /// recipient count and the number of batches that will be enqueued, and
    /// linking any freshly-created contacts into the start's association.
    ///
    /// Exactly one concurrent caller wins the claim; everyone else gets
    /// `false` and must not enqueue. Calling again after winning is a no-op,
    /// so the operation is idempotent.
    pub fn mark_started_tx(
        &self,
        tx: &Transaction,
        id: StartID,
        contact_count: i64,
        batch_count: i64,
        extra_contacts: &[ContactID],
    ) -> Result<bool> {
        let changed = tx
            .execute(
                "UPDATE flow_starts
                 SET status = 'S', contact_count = ?1, batch_count = ?2, modified_on = ?3
                 WHERE id = ?4 AND status = 'P'",
                params![contact_count, batch_count, ts(Utc::now()), id.0],
            )
            .context("marking start started")?;
        if changed == 0 {
            return Ok(false);
        }
        for contact in extra_contacts {
            tx.execute(
                "INSERT OR IGNORE INTO flow_start_contacts (flowstart_id, contact_id) VALUES (?1, ?2)",
                params![id.0, contact.0],
            )
            .context("linking start contact")?;
        }
        Ok(true)
    }

    pub fn mark_started(
        &self,
        id: StartID,
        contact_count: i64,
        batch_count: i64,
        extra_contacts: &[ContactID],
    ) -> Result<bool> {
        self.with_tx(|tx| self.mark_started_tx(tx, id, contact_count, batch_count, extra_contacts))
    }

    /// Set a start complete unless it is already terminal. Idempotent.
    pub fn mark_complete(&self, id: StartID) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE flow_starts SET status = 'C', modified_on = ?1
                 WHERE id = ?2 AND status NOT IN ('C', 'F')",
                params![ts(Utc::now()), id.0],
            )
            .context("marking start complete")?;
        Ok(changed > 0)
    }

    /// Record an unrecoverable failure. Reachable from pending (resolution
    /// error) and starting (batch failure); terminal states stay put.
    pub fn mark_failed(&self, id: StartID) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE flow_starts SET status = 'F', modified_on = ?1
                 WHERE id = ?2 AND status IN ('P', 'S')",
                params![ts(Utc::now()), id.0],
            )
            .context("marking start failed")?;
        Ok(changed > 0)
    }

    /// Record that a contact is being entered into this start's flow,
    /// linking it into the association if it is not there yet. Returns false
    /// when the contact was already entered, so a redelivered batch skips
    /// contacts the crashed worker got to.
    pub fn mark_contact_entered(&self, id: StartID, contact: ContactID) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "INSERT INTO flow_start_contacts (flowstart_id, contact_id, entered) VALUES (?1, ?2, 1)
                 ON CONFLICT(flowstart_id, contact_id) DO UPDATE SET entered = 1
                 WHERE flow_start_contacts.entered = 0",
                params![id.0, contact.0],
            )
            .context("recording contact entry")?;
        Ok(changed > 0)
    }

    pub fn start_contacts(&self, id: StartID) -> Result<Vec<ContactID>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT contact_id FROM flow_start_contacts WHERE flowstart_id = ?1 ORDER BY contact_id",
        )?;
        let ids = stmt
            .query_map(params![id.0], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("loading start contacts")?;
        Ok(ids.into_iter().map(ContactID).collect())
    }

    /// Atomically count one finished batch; returns (completed, total) so the
    /// caller that lands the final batch can flip the start to complete.
    pub fn record_batch_done(&self, id: StartID) -> Result<(i64, i64)> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE flow_starts SET completed_batches = completed_batches + 1, modified_on = ?1
                 WHERE id = ?2",
                params![ts(Utc::now()), id.0],
            )
            .context("counting finished batch")?;
            tx.query_row(
                "SELECT completed_batches, batch_count FROM flow_starts WHERE id = ?1",
                params![id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("reading batch counters")
        })
    }
}

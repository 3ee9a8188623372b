use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use flowline_core::{BroadcastID, ContactID, FlowID, GroupID, OrgID, RepeatPeriod, ScheduleID, TriggerID};

use crate::store::{parse_ts, ts, Store};

/// A recurring or one-shot fire time, owned by one org.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: ScheduleID,
    pub org_id: OrgID,
    pub repeat_period: RepeatPeriod,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fire: Option<DateTime<Utc>>,
}

/// A flow trigger bound to a schedule, with its stored recipients.
#[derive(Debug, Clone)]
pub struct ScheduleTrigger {
    pub id: TriggerID,
    pub org_id: OrgID,
    pub schedule_id: ScheduleID,
    pub flow_id: FlowID,
    pub contact_ids: Vec<ContactID>,
    pub group_ids: Vec<GroupID>,
}

/// Broadcast statuses; re-materialized copies start queued and batch workers
/// flip them to sent.
pub const BROADCAST_QUEUED: &str = "Q";
pub const BROADCAST_SENT: &str = "S";

/// A stored broadcast. Doubles as the `send_broadcast` task payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: BroadcastID,
    pub org_id: OrgID,
    #[serde(default)]
    pub parent_id: Option<BroadcastID>,
    #[serde(default)]
    pub schedule_id: Option<ScheduleID>,
    pub status: String,
    pub base_language: String,
    pub translations: HashMap<String, String>,
    #[serde(default)]
    pub contact_ids: Vec<ContactID>,
    #[serde(default)]
    pub group_ids: Vec<GroupID>,
}

impl Broadcast {
    /// The text to send, in the base language.
    pub fn text(&self) -> Option<&str> {
        self.translations.get(&self.base_language).map(String::as_str)
    }
}

impl Store {
    pub fn insert_schedule(
        &self,
        org_id: OrgID,
        repeat_period: RepeatPeriod,
        next_fire: Option<DateTime<Utc>>,
    ) -> Result<ScheduleID> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO schedules (org_id, repeat_period, next_fire) VALUES (?1, ?2, ?3)",
            params![org_id.0, repeat_period.as_str(), next_fire.map(ts)],
        )
        .context("inserting schedule")?;
        Ok(ScheduleID(conn.last_insert_rowid()))
    }

    pub fn get_schedule(&self, id: ScheduleID) -> Result<Option<Schedule>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, org_id, repeat_period, next_fire, last_fire FROM schedules WHERE id = ?1",
            params![id.0],
            row_to_schedule_parts,
        )
        .optional()
        .context("loading schedule")?
        .map(parts_to_schedule)
        .transpose()
    }

    /// Active schedules due at or before `now`, in `next_fire` order.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, org_id, repeat_period, next_fire, last_fire
             FROM schedules
             WHERE is_active = 1 AND next_fire IS NOT NULL AND next_fire <= ?1
             ORDER BY next_fire",
        )?;
        let rows = stmt
            .query_map(params![ts(now)], row_to_schedule_parts)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("selecting due schedules")?;
        rows.into_iter().map(parts_to_schedule).collect()
    }

    /// Persist the outcome of a fire: `last_fire` is the fire just processed
    /// and `next_fire` is the recomputed time, or None for one-shots.
    pub fn set_schedule_fired_tx(
        &self,
        tx: &Transaction,
        id: ScheduleID,
        last_fire: DateTime<Utc>,
        next_fire: Option<DateTime<Utc>>,
    ) -> Result<()> {
        tx.execute(
            "UPDATE schedules SET last_fire = ?1, next_fire = ?2 WHERE id = ?3",
            params![ts(last_fire), next_fire.map(ts), id.0],
        )
        .context("updating fired schedule")?;
        Ok(())
    }

    pub fn insert_schedule_trigger(
        &self,
        org_id: OrgID,
        schedule_id: ScheduleID,
        flow_id: FlowID,
        contact_ids: &[ContactID],
        group_ids: &[GroupID],
    ) -> Result<TriggerID> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO schedule_triggers (org_id, schedule_id, flow_id, contact_ids, group_ids)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                org_id.0,
                schedule_id.0,
                flow_id.0,
                serde_json::to_string(contact_ids)?,
                serde_json::to_string(group_ids)?,
            ],
        )
        .context("inserting schedule trigger")?;
        Ok(TriggerID(conn.last_insert_rowid()))
    }

    pub fn trigger_for_schedule(&self, schedule_id: ScheduleID) -> Result<Option<ScheduleTrigger>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, org_id, schedule_id, flow_id, contact_ids, group_ids
             FROM schedule_triggers WHERE schedule_id = ?1 AND is_archived = 0",
            params![schedule_id.0],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .context("loading schedule trigger")?
        .map(|(id, org_id, schedule_id, flow_id, contacts, groups)| {
            Ok(ScheduleTrigger {
                id: TriggerID(id),
                org_id: OrgID(org_id),
                schedule_id: ScheduleID(schedule_id),
                flow_id: FlowID(flow_id),
                contact_ids: serde_json::from_str(&contacts).context("decoding trigger contacts")?,
                group_ids: serde_json::from_str(&groups).context("decoding trigger groups")?,
            })
        })
        .transpose()
    }

    pub fn insert_broadcast(
        &self,
        org_id: OrgID,
        schedule_id: Option<ScheduleID>,
        base_language: &str,
        translations: &HashMap<String, String>,
        contact_ids: &[ContactID],
        group_ids: &[GroupID],
    ) -> Result<BroadcastID> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO broadcasts (org_id, schedule_id, base_language, translations, contact_ids, group_ids, created_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                org_id.0,
                schedule_id.map(|s| s.0),
                base_language,
                serde_json::to_string(translations)?,
                serde_json::to_string(contact_ids)?,
                serde_json::to_string(group_ids)?,
                ts(Utc::now()),
            ],
        )
        .context("inserting broadcast")?;
        Ok(BroadcastID(conn.last_insert_rowid()))
    }

    pub fn get_broadcast(&self, id: BroadcastID) -> Result<Option<Broadcast>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{BROADCAST_SELECT} WHERE id = ?1"),
            params![id.0],
            row_to_broadcast_parts,
        )
        .optional()
        .context("loading broadcast")?
        .map(parts_to_broadcast)
        .transpose()
    }

    pub fn broadcast_for_schedule(&self, schedule_id: ScheduleID) -> Result<Option<Broadcast>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{BROADCAST_SELECT} WHERE schedule_id = ?1"),
            params![schedule_id.0],
            row_to_broadcast_parts,
        )
        .optional()
        .context("loading schedule broadcast")?
        .map(parts_to_broadcast)
        .transpose()
    }

    /// Re-materialize a scheduled broadcast as a fresh queued copy pointing
    /// back at its parent, targeting the same recipients.
    pub fn clone_broadcast_tx(&self, tx: &Transaction, parent: &Broadcast) -> Result<BroadcastID> {
        tx.execute(
            "INSERT INTO broadcasts (org_id, parent_id, status, base_language, translations, contact_ids, group_ids, created_on)
             VALUES (?1, ?2, 'Q', ?3, ?4, ?5, ?6, ?7)",
            params![
                parent.org_id.0,
                parent.id.0,
                parent.base_language,
                serde_json::to_string(&parent.translations)?,
                serde_json::to_string(&parent.contact_ids)?,
                serde_json::to_string(&parent.group_ids)?,
                ts(Utc::now()),
            ],
        )
        .context("cloning broadcast")?;
        Ok(BroadcastID(tx.last_insert_rowid()))
    }

    pub fn set_broadcast_status(&self, id: BroadcastID, status: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE broadcasts SET status = ?1 WHERE id = ?2",
                params![status, id.0],
            )
            .context("updating broadcast status")?;
        Ok(())
    }
}

const BROADCAST_SELECT: &str =
    "SELECT id, org_id, parent_id, schedule_id, status, base_language, translations, contact_ids, group_ids
     FROM broadcasts";

type ScheduleParts = (i64, i64, String, Option<String>, Option<String>);

fn row_to_schedule_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn parts_to_schedule((id, org_id, repeat, next_fire, last_fire): ScheduleParts) -> Result<Schedule> {
    Ok(Schedule {
        id: ScheduleID(id),
        org_id: OrgID(org_id),
        repeat_period: RepeatPeriod::parse(&repeat)
            .with_context(|| format!("unknown repeat period '{repeat}'"))?,
        next_fire: next_fire.as_deref().map(parse_ts).transpose()?,
        last_fire: last_fire.as_deref().map(parse_ts).transpose()?,
    })
}

type BroadcastParts = (
    i64,
    i64,
    Option<i64>,
    Option<i64>,
    String,
    String,
    String,
    String,
    String,
);

fn row_to_broadcast_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<BroadcastParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn parts_to_broadcast(parts: BroadcastParts) -> Result<Broadcast> {
    let (id, org_id, parent_id, schedule_id, status, base_language, translations, contacts, groups) =
        parts;
    Ok(Broadcast {
        id: BroadcastID(id),
        org_id: OrgID(org_id),
        parent_id: parent_id.map(BroadcastID),
        schedule_id: schedule_id.map(ScheduleID),
        status,
        base_language,
        translations: serde_json::from_str(&translations).context("decoding translations")?,
        contact_ids: serde_json::from_str(&contacts).context("decoding broadcast contacts")?,
        group_ids: serde_json::from_str(&groups).context("decoding broadcast groups")?,
    })
}

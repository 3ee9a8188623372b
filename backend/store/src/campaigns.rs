use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Transaction};

use flowline_core::{CampaignEventID, ContactID, FireID, FlowID, FlowType, OrgID};

use crate::store::{ts, Store};

/// One unclaimed (contact, event, time) occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFire {
    pub id: FireID,
    pub contact_id: ContactID,
}

/// All due fires of one campaign event, ready to be claimed as a unit and
/// converted into a single start of the event's flow.
#[derive(Debug, Clone)]
pub struct FireGroup {
    pub event_id: CampaignEventID,
    pub org_id: OrgID,
    pub flow_id: FlowID,
    pub flow_type: FlowType,
    pub fires: Vec<EventFire>,
}

impl FireGroup {
    pub fn fire_ids(&self) -> Vec<FireID> {
        self.fires.iter().map(|f| f.id).collect()
    }

    /// Contacts of the fires in `claimed`, in scheduled order.
    pub fn contacts_for(&self, claimed: &[FireID]) -> Vec<ContactID> {
        self.fires
            .iter()
            .filter(|f| claimed.contains(&f.id))
            .map(|f| f.contact_id)
            .collect()
    }
}

impl Store {
    pub fn insert_campaign_event(&self, org_id: OrgID, flow_id: FlowID) -> Result<CampaignEventID> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO campaign_events (org_id, flow_id) VALUES (?1, ?2)",
            params![org_id.0, flow_id.0],
        )
        .context("inserting campaign event")?;
        Ok(CampaignEventID(conn.last_insert_rowid()))
    }

    pub fn insert_event_fire(
        &self,
        event_id: CampaignEventID,
        contact_id: ContactID,
        scheduled: DateTime<Utc>,
    ) -> Result<FireID> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO event_fires (event_id, contact_id, scheduled) VALUES (?1, ?2, ?3)",
            params![event_id.0, contact_id.0, ts(scheduled)],
        )
        .context("inserting event fire")?;
        Ok(FireID(conn.last_insert_rowid()))
    }

    /// Unfired fires due at or before `now`, joined to their event and flow
    /// and grouped per event.
    pub fn due_fire_groups(&self, now: DateTime<Utc>) -> Result<Vec<FireGroup>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT f.id, f.contact_id, e.id, e.org_id, e.flow_id, fl.flow_type
             FROM event_fires f
             JOIN campaign_events e ON e.id = f.event_id
             JOIN flows fl ON fl.id = e.flow_id
             WHERE f.fired IS NULL AND f.scheduled <= ?1
             ORDER BY e.id, f.scheduled, f.id",
        )?;
        let rows = stmt
            .query_map(params![ts(now)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("selecting due event fires")?;

        let mut groups: Vec<FireGroup> = Vec::new();
        for (fire_id, contact_id, event_id, org_id, flow_id, flow_type) in rows {
            let fire = EventFire { id: FireID(fire_id), contact_id: ContactID(contact_id) };
            match groups.last_mut() {
                Some(group) if group.event_id.0 == event_id => group.fires.push(fire),
                _ => groups.push(FireGroup {
                    event_id: CampaignEventID(event_id),
                    org_id: OrgID(org_id),
                    flow_id: FlowID(flow_id),
                    flow_type: FlowType::parse(&flow_type)
                        .with_context(|| format!("unknown flow type '{flow_type}'"))?,
                    fires: vec![fire],
                }),
            }
        }
        Ok(groups)
    }

    /// Claim fire rows by stamping `fired`. Each row is claimed at most once
    /// ever; the returned ids are the subset this caller won.
    pub fn claim_fires_tx(
        &self,
        tx: &Transaction,
        fires: &[FireID],
        now: DateTime<Utc>,
    ) -> Result<Vec<FireID>> {
        let stamp = ts(now);
        let mut claimed = Vec::with_capacity(fires.len());
        for fire in fires {
            let changed = tx
                .execute(
                    "UPDATE event_fires SET fired = ?1 WHERE id = ?2 AND fired IS NULL",
                    params![stamp, fire.0],
                )
                .context("claiming event fire")?;
            if changed > 0 {
                claimed.push(*fire);
            }
        }
        Ok(claimed)
    }

    /// Count of fires of an event that carry a fired timestamp.
    pub fn fired_count(&self, event_id: CampaignEventID) -> Result<i64> {
        self.conn()?
            .query_row(
                "SELECT count(*) FROM event_fires WHERE event_id = ?1 AND fired IS NOT NULL",
                params![event_id.0],
                |row| row.get(0),
            )
            .context("counting fired events")
    }
}

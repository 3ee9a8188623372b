use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;

use crate::store::{ts, Store};

/// Named advisory locks over the shared store, used to guarantee that only
/// one process in a fleet runs a given cron body at a time.
///
/// Acquisition is non-blocking: a caller that loses simply skips its tick.
/// Locks expire after their TTL so a crashed holder cannot wedge the fleet.
impl Store {
    /// Try to take the named lock for `ttl`. Re-acquiring a lock this owner
    /// already holds extends it.
    pub fn try_acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires = ts(now + chrono::Duration::from_std(ttl).context("lock ttl out of range")?);

        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM locks WHERE name = ?1 AND expires_on < ?2",
                params![name, ts(now)],
            )
            .context("expiring stale lock")?;
            tx.execute(
                "INSERT INTO locks (name, owner, expires_on) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET expires_on = excluded.expires_on
                 WHERE locks.owner = excluded.owner",
                params![name, owner, expires],
            )
            .context("acquiring lock")?;
            let holder: String = tx
                .query_row("SELECT owner FROM locks WHERE name = ?1", params![name], |row| {
                    row.get(0)
                })
                .context("reading lock holder")?;
            Ok(holder == owner)
        })
    }

    /// Release the named lock if this owner still holds it.
    pub fn release_lock(&self, name: &str, owner: &str) -> Result<()> {
        self.conn()?
            .execute(
                "DELETE FROM locks WHERE name = ?1 AND owner = ?2",
                params![name, owner],
            )
            .context("releasing lock")?;
        Ok(())
    }
}

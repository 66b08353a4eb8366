//! Outbox: batches staged before delivery, removed on acknowledgement.
//!
//! Anything still here at startup was in flight when the process stopped
//! and is delivered again.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;

use super::Pool;
use crate::sink::EventBatch;

#[derive(Clone)]
pub struct OutboxStore {
    pool: Pool,
}

impl OutboxStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn stage(&self, batch: &EventBatch) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO outbox (batch_id, events_json, event_count, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                batch.batch_id.to_string(),
                serde_json::to_string(&batch.events)?,
                batch.events.len() as i64,
                batch.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn ack(&self, batch: &EventBatch) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM outbox WHERE batch_id = ?1",
            params![batch.batch_id.to_string()],
        )?;
        Ok(())
    }

    /// Unacknowledged batches, oldest first.
    pub fn pending(&self) -> Result<Vec<EventBatch>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT batch_id, events_json, created_at FROM outbox ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut batches = Vec::new();
        for row in rows {
            let (id, events, created_at) = row?;
            batches.push(EventBatch {
                batch_id: id.parse()?,
                events: serde_json::from_str(&events)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
            });
        }
        Ok(batches)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

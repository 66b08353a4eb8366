//! Dead-letter store for batches that exhausted every delivery attempt.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use super::Pool;
use crate::sink::EventBatch;

/// One dead-lettered batch.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub batch: EventBatch,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DeadLetterStore {
    pool: Pool,
}

impl DeadLetterStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Persist a failed batch and drop it from the outbox in one
    /// transaction. Returns `false` if the batch was already dead-lettered.
    pub fn record(&self, batch: &EventBatch, attempts: u32, last_error: &str) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO dead_letters
                (batch_id, events_json, event_count, attempts, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                batch.batch_id.to_string(),
                serde_json::to_string(&batch.events)?,
                batch.events.len() as i64,
                attempts,
                last_error,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.execute(
            "DELETE FROM outbox WHERE batch_id = ?1",
            params![batch.batch_id.to_string()],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    pub fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, batch_id, events_json, attempts, last_error, created_at
             FROM dead_letters ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut letters = Vec::new();
        for row in rows {
            let (id, batch_id, events, attempts, last_error, created_at) = row?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc);
            letters.push(DeadLetter {
                id,
                batch: EventBatch {
                    batch_id: batch_id.parse()?,
                    events: serde_json::from_str(&events)?,
                    created_at,
                },
                attempts,
                last_error,
                created_at,
            });
        }
        Ok(letters)
    }

    pub fn remove(&self, batch_id: Uuid) -> Result<bool> {
        let conn = self.pool.get()?;
        let n = conn.execute(
            "DELETE FROM dead_letters WHERE batch_id = ?1",
            params![batch_id.to_string()],
        )?;
        Ok(n == 1)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

//! Overflow store: disk spillover for samples the admission queue refused.
//!
//! Records are per-source batches of up to `spill_batch_size` samples. The
//! newest record of a source stays open for appends until it is full or the
//! recovery sweep claims it; claiming seals it in the same transaction, so
//! the writer never touches a record the sweep is replaying. Records are
//! replayed in id order (spill time, oldest first) and deleted only after
//! their samples are back in the queue.

use std::collections::HashMap;
use std::fmt::Display;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::Pool;
use crate::config::StorageConfig;
use crate::error::SpilloverError;
use crate::sources::MetricSample;

fn storage_err(e: impl Display) -> SpilloverError {
    SpilloverError::Storage(e.to_string())
}

fn stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A claimed (sealed) overflow record.
#[derive(Debug, Clone)]
pub struct OverflowRecord {
    pub id: i64,
    pub source_id: String,
    pub samples: Vec<MetricSample>,
    pub spilled_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OverflowStore {
    pool: Pool,
    max_records: usize,
    batch_size: usize,
}

impl OverflowStore {
    pub fn new(pool: Pool, config: &StorageConfig) -> Self {
        Self {
            pool,
            max_records: config.overflow_max_records,
            batch_size: config.spill_batch_size.max(1),
        }
    }

    /// Append one sample to its source's open record, or start a new one.
    pub fn append(&self, sample: &MetricSample) -> Result<(), SpilloverError> {
        let mut conn = self.pool.get().map_err(storage_err)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;

        let newest: Option<(i64, String, i64, bool)> = tx
            .query_row(
                "SELECT id, samples_json, sample_count, sealed FROM overflow
                 WHERE source_id = ?1 ORDER BY id DESC LIMIT 1",
                params![sample.source_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(storage_err)?;

        match newest {
            Some((id, json, count, false)) if (count as usize) < self.batch_size => {
                let mut samples: Vec<MetricSample> = serde_json::from_str(&json)?;
                samples.push(sample.clone());
                tx.execute(
                    "UPDATE overflow SET samples_json = ?1, sample_count = ?2 WHERE id = ?3",
                    params![serde_json::to_string(&samples)?, samples.len() as i64, id],
                )
                .map_err(storage_err)?;
            }
            _ => {
                let records: i64 = tx
                    .query_row("SELECT COUNT(*) FROM overflow", [], |row| row.get(0))
                    .map_err(storage_err)?;
                if records as usize >= self.max_records {
                    return Err(SpilloverError::QuotaExceeded {
                        records: records as usize,
                        limit: self.max_records,
                    });
                }
                tx.execute(
                    "INSERT INTO overflow (source_id, samples_json, sample_count, spilled_at)
                     VALUES (?1, ?2, 1, ?3)",
                    params![
                        sample.source_id,
                        serde_json::to_string(std::slice::from_ref(sample))?,
                        stamp(Utc::now())
                    ],
                )
                .map_err(storage_err)?;
            }
        }

        tx.commit().map_err(storage_err)
    }

    /// Seal and return the oldest record, if any.
    pub fn claim_oldest(&self) -> Result<Option<OverflowRecord>, SpilloverError> {
        let mut conn = self.pool.get().map_err(storage_err)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;

        let row: Option<(i64, String, String, String)> = tx
            .query_row(
                "SELECT id, source_id, samples_json, spilled_at FROM overflow
                 ORDER BY id ASC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(storage_err)?;

        let Some((id, source_id, json, spilled_at)) = row else {
            return Ok(None);
        };
        tx.execute("UPDATE overflow SET sealed = 1 WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;

        let spilled_at = DateTime::parse_from_rfc3339(&spilled_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(storage_err)?;
        Ok(Some(OverflowRecord {
            id,
            source_id,
            samples: serde_json::from_str(&json)?,
            spilled_at,
        }))
    }

    /// Delete a fully replayed record.
    pub fn remove(&self, id: i64) -> Result<(), SpilloverError> {
        let conn = self.pool.get().map_err(storage_err)?;
        conn.execute("DELETE FROM overflow WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(())
    }

    /// Keep only the samples of a record that were not replayed yet.
    pub fn retain(&self, id: i64, remaining: &[MetricSample]) -> Result<(), SpilloverError> {
        if remaining.is_empty() {
            return self.remove(id);
        }
        let conn = self.pool.get().map_err(storage_err)?;
        conn.execute(
            "UPDATE overflow SET samples_json = ?1, sample_count = ?2 WHERE id = ?3",
            params![serde_json::to_string(remaining)?, remaining.len() as i64, id],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Delete records spilled before `cutoff`; returns purged sample counts
    /// per source.
    pub fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, u64)>, SpilloverError> {
        let mut conn = self.pool.get().map_err(storage_err)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        let cutoff = stamp(cutoff);

        let purged: Vec<(String, u64)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT source_id, SUM(sample_count) FROM overflow
                     WHERE spilled_at < ?1 GROUP BY source_id ORDER BY source_id",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })
                .map_err(storage_err)?;
            rows.collect::<Result<_, _>>().map_err(storage_err)?
        };

        if !purged.is_empty() {
            let n = tx
                .execute("DELETE FROM overflow WHERE spilled_at < ?1", params![cutoff])
                .map_err(storage_err)?;
            debug!(records = n, "purged expired overflow records");
        }
        tx.commit().map_err(storage_err)?;
        Ok(purged)
    }

    pub fn record_count(&self) -> Result<usize, SpilloverError> {
        let conn = self.pool.get().map_err(storage_err)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM overflow", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(n as usize)
    }

    /// Samples waiting per source; seeds the ingestion backlog at startup.
    pub fn pending_by_source(&self) -> Result<HashMap<String, u64>, SpilloverError> {
        let conn = self.pool.get().map_err(storage_err)?;
        let mut stmt = conn
            .prepare("SELECT source_id, SUM(sample_count) FROM overflow GROUP BY source_id")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(storage_err)?;
        rows.collect::<Result<_, _>>().map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    fn store(pool: Pool, max_records: usize, batch: usize) -> OverflowStore {
        OverflowStore::new(
            pool,
            &StorageConfig {
                overflow_max_records: max_records,
                spill_batch_size: batch,
                ..Default::default()
            },
        )
    }

    fn sample(source: &str, v: f64) -> MetricSample {
        MetricSample::new(source, "cpu", v, Utc::now())
    }

    #[test]
    fn test_fifo_claim_and_remove() {
        let (_dir, pool) = test_pool();
        let store = store(pool, 100, 1);
        store.append(&sample("a", 1.0)).unwrap();
        store.append(&sample("b", 2.0)).unwrap();
        store.append(&sample("a", 3.0)).unwrap();
        assert_eq!(store.record_count().unwrap(), 3);

        let first = store.claim_oldest().unwrap().unwrap();
        assert_eq!(first.source_id, "a");
        assert_eq!(first.samples[0].value, 1.0);
        store.remove(first.id).unwrap();

        let second = store.claim_oldest().unwrap().unwrap();
        assert_eq!(second.source_id, "b");
        store.remove(second.id).unwrap();

        let third = store.claim_oldest().unwrap().unwrap();
        assert_eq!(third.samples[0].value, 3.0);
        store.remove(third.id).unwrap();
        assert!(store.claim_oldest().unwrap().is_none());
    }

    #[test]
    fn test_batches_per_source_until_sealed() {
        let (_dir, pool) = test_pool();
        let store = store(pool, 100, 3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            store.append(&sample("a", v)).unwrap();
        }
        store.append(&sample("b", 9.0)).unwrap();
        // a: [1,2,3] + [4]; b: [9]
        assert_eq!(store.record_count().unwrap(), 3);
        assert_eq!(store.pending_by_source().unwrap()["a"], 4);

        let first = store.claim_oldest().unwrap().unwrap();
        assert_eq!(
            first.samples.iter().map(|s| s.value).collect::<Vec<_>>(),
            vec![1.0, 2.0, 3.0]
        );
        store.remove(first.id).unwrap();

        // Claiming seals: later appends for `a` open a fresh record.
        let second = store.claim_oldest().unwrap().unwrap();
        assert_eq!(second.samples.len(), 1);
        store.append(&sample("a", 5.0)).unwrap();
        assert_eq!(store.record_count().unwrap(), 3);
    }

    #[test]
    fn test_retain_keeps_unreplayed_tail() {
        let (_dir, pool) = test_pool();
        let store = store(pool, 100, 4);
        for v in [1.0, 2.0, 3.0] {
            store.append(&sample("a", v)).unwrap();
        }
        let rec = store.claim_oldest().unwrap().unwrap();
        store.retain(rec.id, &rec.samples[2..]).unwrap();
        let again = store.claim_oldest().unwrap().unwrap();
        assert_eq!(again.id, rec.id);
        assert_eq!(again.samples.len(), 1);
        assert_eq!(again.samples[0].value, 3.0);
    }

    #[test]
    fn test_quota_exceeded() {
        let (_dir, pool) = test_pool();
        let store = store(pool, 2, 1);
        store.append(&sample("a", 1.0)).unwrap();
        store.append(&sample("a", 2.0)).unwrap();
        assert!(matches!(
            store.append(&sample("a", 3.0)),
            Err(SpilloverError::QuotaExceeded { records: 2, limit: 2 })
        ));
    }

    #[test]
    fn test_purge_expired() {
        let (_dir, pool) = test_pool();
        let store = store(pool, 100, 2);
        for v in [1.0, 2.0, 3.0] {
            store.append(&sample("a", v)).unwrap();
        }
        store.append(&sample("b", 1.0)).unwrap();
        let purged = store
            .purge_older_than(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(purged, vec![("a".to_string(), 3), ("b".to_string(), 1)]);
        assert_eq!(store.record_count().unwrap(), 0);
        assert!(store
            .purge_older_than(Utc::now())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_samples_round_trip_exactly() {
        let (_dir, pool) = test_pool();
        let store = store(pool, 100, 1);
        let original = MetricSample::new("a", "cpu", 0.1 + 0.2, Utc::now());
        store.append(&original).unwrap();
        let rec = store.claim_oldest().unwrap().unwrap();
        assert_eq!(rec.samples[0], original);
    }
}

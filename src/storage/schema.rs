//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Spilled sample batches, replayed oldest id first. AUTOINCREMENT
        -- keeps ids monotonic across deletes.
        CREATE TABLE IF NOT EXISTS overflow (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            samples_json TEXT NOT NULL,
            sample_count INTEGER NOT NULL,
            sealed INTEGER NOT NULL DEFAULT 0,
            spilled_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_overflow_source ON overflow(source_id, id);

        -- Batches handed to the downstream but not yet acknowledged.
        CREATE TABLE IF NOT EXISTS outbox (
            batch_id TEXT PRIMARY KEY,
            events_json TEXT NOT NULL,
            event_count INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id TEXT NOT NULL UNIQUE,
            events_json TEXT NOT NULL,
            event_count INTEGER NOT NULL,
            attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_dead_letters_created ON dead_letters(created_at);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

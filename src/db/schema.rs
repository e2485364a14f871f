// Database schema: table creation and migrations.
//
// A `schema_version` table tracks which migrations have run, and each
// migration is a function that executes SQL statements.

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Create all tables if they don't exist yet.
///
/// Idempotent, so it runs on every startup.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Dedup registry. One row per post identifier ever accepted; the
        -- normalized payload is kept so unfinished posts survive a restart.
        CREATE TABLE IF NOT EXISTS seen_posts (
            post_id TEXT PRIMARY KEY,
            account TEXT NOT NULL,             -- lowercased author handle
            channel TEXT NOT NULL,             -- 'webhook' or 'polling'
            post_json TEXT NOT NULL,
            state TEXT NOT NULL,
            post_created_at TEXT NOT NULL,     -- RFC 3339, origin timestamp
            first_seen_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Every AI-analysis attempt. The highest attempt per post wins.
        CREATE TABLE IF NOT EXISTS enrichment_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id TEXT NOT NULL REFERENCES seen_posts(post_id),
            attempt INTEGER NOT NULL,
            success INTEGER NOT NULL,
            analysis TEXT,
            model TEXT,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            total_tokens INTEGER,
            duration_ms INTEGER NOT NULL,
            error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- One delivery record per post that entered dispatch.
        CREATE TABLE IF NOT EXISTS delivery_records (
            post_id TEXT PRIMARY KEY REFERENCES seen_posts(post_id),
            status TEXT NOT NULL,              -- pending / delivered / failed
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            delivered_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Per-account polling watermarks and misc scheduler state
        CREATE TABLE IF NOT EXISTS scan_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_seen_posts_state
            ON seen_posts(state);

        CREATE INDEX IF NOT EXISTS idx_seen_posts_account
            ON seen_posts(account, post_created_at);

        CREATE INDEX IF NOT EXISTS idx_enrichment_post
            ON enrichment_attempts(post_id, attempt);
        ",
    )
    .context("Failed to create database tables")?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [1],
    )?;

    // Migration v2: remember the messaging channel's message id so a
    // delivered alert can be traced back from the chat.
    run_migration(conn, 2, |c| {
        c.execute_batch("ALTER TABLE delivery_records ADD COLUMN message_id TEXT;")
    })?;

    Ok(())
}

/// Run a migration if it hasn't been applied yet.
fn run_migration<F>(conn: &Connection, version: i64, migrate: F) -> Result<()>
where
    F: FnOnce(&Connection) -> rusqlite::Result<()>,
{
    let already_applied: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM schema_version WHERE version = ?1",
        [version],
        |row| row.get(0),
    )?;

    if !already_applied {
        migrate(conn).with_context(|| format!("Migration v{version} failed"))?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [version],
        )?;
    }

    Ok(())
}

/// Count the number of tables in the database (useful for init confirmation).
pub fn table_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

// Database queries: CRUD operations for all tables.
//
// Every database interaction goes through this module. This keeps SQL
// contained in one place and gives the rest of the app clean Rust interfaces.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{
    Channel, DeliveryRecord, DeliveryStatus, EnrichmentResult, Post, PostState, TokenUsage,
};

// --- Scan state ---

/// Get a scan state value by key (e.g., "last_seen:alice").
pub fn get_scan_state(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM scan_state WHERE key = ?1")?;
    let result = stmt.query_row(params![key], |row| row.get(0)).optional()?;
    Ok(result)
}

/// Set a scan state value (upsert).
pub fn set_scan_state(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO scan_state (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
        params![key, value],
    )?;
    Ok(())
}

/// All scan state entries, ordered by key.
pub fn get_all_scan_state(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT key, value FROM scan_state ORDER BY key")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// --- Seen posts (dedup registry) ---

/// Record a post as seen. Returns `true` only for the call that actually
/// inserted the row; an already-seen identifier is a no-op returning `false`.
pub fn insert_seen_post(
    conn: &Connection,
    post: &Post,
    channel: Channel,
    state: PostState,
) -> Result<bool> {
    let json = serde_json::to_string(post)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO seen_posts
            (post_id, account, channel, post_json, state, post_created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            post.id,
            post.account_key(),
            channel.as_str(),
            json,
            state.as_str(),
            post.created_at.to_rfc3339(),
        ],
    )?;
    Ok(inserted == 1)
}

pub fn is_post_seen(conn: &Connection, post_id: &str) -> Result<bool> {
    let seen: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM seen_posts WHERE post_id = ?1",
        params![post_id],
        |row| row.get(0),
    )?;
    Ok(seen)
}

pub fn set_post_state(conn: &Connection, post_id: &str, state: PostState) -> Result<()> {
    let updated = conn.execute(
        "UPDATE seen_posts SET state = ?2, updated_at = datetime('now') WHERE post_id = ?1",
        params![post_id, state.as_str()],
    )?;
    if updated == 0 {
        anyhow::bail!("Post {post_id} is not in the dedup store");
    }
    Ok(())
}

pub fn get_post(conn: &Connection, post_id: &str) -> Result<Option<Post>> {
    let mut stmt = conn.prepare("SELECT post_json, state FROM seen_posts WHERE post_id = ?1")?;
    let row: Option<(String, String)> = stmt
        .query_row(params![post_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;
    row.map(|(json, state)| decode_post(&json, &state)).transpose()
}

/// Posts that were accepted but never reached a terminal state, oldest first.
pub fn get_unfinished_posts(conn: &Connection) -> Result<Vec<Post>> {
    let mut stmt = conn.prepare(
        "SELECT post_json, state FROM seen_posts
         WHERE state NOT IN ('delivered', 'delivery_failed', 'duplicate', 'candidate')
         ORDER BY post_created_at ASC",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.iter()
        .map(|(json, state)| decode_post(json, state))
        .collect()
}

pub fn count_posts_by_state(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt =
        conn.prepare("SELECT state, COUNT(*) FROM seen_posts GROUP BY state ORDER BY state")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn decode_post(json: &str, state: &str) -> Result<Post> {
    let mut post: Post = serde_json::from_str(json).context("Corrupt post payload in seen_posts")?;
    post.state = state.parse()?;
    Ok(post)
}

// --- Enrichment attempts ---

pub fn insert_enrichment_attempt(conn: &Connection, result: &EnrichmentResult) -> Result<i64> {
    let usage = result.usage.unwrap_or_default();
    let has_usage = result.usage.is_some();
    conn.execute(
        "INSERT INTO enrichment_attempts
            (post_id, attempt, success, analysis, model, prompt_tokens,
             completion_tokens, total_tokens, duration_ms, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            result.post_id,
            result.attempt,
            result.success,
            result.analysis,
            result.model,
            has_usage.then_some(usage.prompt_tokens),
            has_usage.then_some(usage.completion_tokens),
            has_usage.then_some(usage.total_tokens),
            i64::try_from(result.duration_ms).unwrap_or(i64::MAX),
            result.error,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// The authoritative attempt for a post: the most recent one.
pub fn latest_enrichment(conn: &Connection, post_id: &str) -> Result<Option<EnrichmentResult>> {
    let mut stmt = conn.prepare(
        "SELECT post_id, attempt, success, analysis, model, prompt_tokens,
                completion_tokens, total_tokens, duration_ms, error, created_at
         FROM enrichment_attempts
         WHERE post_id = ?1
         ORDER BY attempt DESC, id DESC
         LIMIT 1",
    )?;
    let result = stmt
        .query_row(params![post_id], |row| {
            let prompt: Option<u32> = row.get(5)?;
            let completion: Option<u32> = row.get(6)?;
            let total: Option<u32> = row.get(7)?;
            let duration: i64 = row.get(8)?;
            Ok(EnrichmentResult {
                post_id: row.get(0)?,
                attempt: row.get(1)?,
                success: row.get(2)?,
                analysis: row.get(3)?,
                model: row.get(4)?,
                usage: total.map(|total_tokens| TokenUsage {
                    prompt_tokens: prompt.unwrap_or(0),
                    completion_tokens: completion.unwrap_or(0),
                    total_tokens,
                }),
                duration_ms: u64::try_from(duration).unwrap_or(0),
                error: row.get(9)?,
                created_at: row.get(10)?,
            })
        })
        .optional()?;
    Ok(result)
}

pub fn count_enrichment_attempts(conn: &Connection, post_id: &str) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM enrichment_attempts WHERE post_id = ?1",
        params![post_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// --- Delivery records ---

/// Create the pending record if missing and return the current one.
pub fn start_delivery(conn: &Connection, post_id: &str) -> Result<DeliveryRecord> {
    conn.execute(
        "INSERT OR IGNORE INTO delivery_records (post_id, status, attempts)
         VALUES (?1, 'pending', 0)",
        params![post_id],
    )?;
    get_delivery(conn, post_id)?
        .with_context(|| format!("Delivery record for {post_id} vanished after insert"))
}

pub fn record_delivery_attempt(
    conn: &Connection,
    post_id: &str,
    attempts: u32,
    error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE delivery_records
         SET attempts = ?2, last_error = COALESCE(?3, last_error), updated_at = datetime('now')
         WHERE post_id = ?1",
        params![post_id, attempts, error],
    )?;
    Ok(())
}

pub fn complete_delivery(
    conn: &Connection,
    post_id: &str,
    attempts: u32,
    message_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE delivery_records
         SET status = 'delivered', attempts = ?2, message_id = ?3,
             delivered_at = datetime('now'), updated_at = datetime('now')
         WHERE post_id = ?1",
        params![post_id, attempts, message_id],
    )?;
    Ok(())
}

pub fn fail_delivery(conn: &Connection, post_id: &str, attempts: u32, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE delivery_records
         SET status = 'failed', attempts = ?2, last_error = ?3, updated_at = datetime('now')
         WHERE post_id = ?1",
        params![post_id, attempts, error],
    )?;
    Ok(())
}

pub fn get_delivery(conn: &Connection, post_id: &str) -> Result<Option<DeliveryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT post_id, status, attempts, last_error, delivered_at, message_id
         FROM delivery_records WHERE post_id = ?1",
    )?;
    let result = stmt.query_row(params![post_id], row_to_delivery).optional()?;
    Ok(result)
}

/// Most recent failed deliveries, newest first.
pub fn recent_delivery_failures(conn: &Connection, limit: u32) -> Result<Vec<DeliveryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT post_id, status, attempts, last_error, delivered_at, message_id
         FROM delivery_records
         WHERE status = 'failed'
         ORDER BY updated_at DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], row_to_delivery)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn count_deliveries_by_status(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM delivery_records GROUP BY status ORDER BY status",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryRecord> {
    let status: String = row.get(1)?;
    Ok(DeliveryRecord {
        post_id: row.get(0)?,
        status: DeliveryStatus::parse(&status),
        attempts: row.get(2)?,
        last_error: row.get(3)?,
        delivered_at: row.get(4)?,
        message_id: row.get(5)?,
    })
}

// SqliteDatabase: rusqlite backend implementing the Database trait.
//
// The Connection is wrapped in tokio::sync::Mutex because Connection is !Sync.
// Trait methods lock the mutex, do synchronous rusqlite work, and return.
// Because every write goes through this one lock, the insert-if-absent in
// `insert_seen_post` is a single-writer serialization point for the dedup
// store: two concurrent callers for the same id cannot both see `true`.

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;

use super::models::{Channel, DeliveryRecord, EnrichmentResult, Post, PostState};
use super::traits::Database;

pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    /// Wrap an already-opened rusqlite Connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn table_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        super::schema::table_count(&conn)
    }

    async fn get_scan_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        super::queries::get_scan_state(&conn, key)
    }

    async fn set_scan_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::set_scan_state(&conn, key, value)
    }

    async fn get_all_scan_state(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().await;
        super::queries::get_all_scan_state(&conn)
    }

    async fn insert_seen_post(
        &self,
        post: &Post,
        channel: Channel,
        state: PostState,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        super::queries::insert_seen_post(&conn, post, channel, state)
    }

    async fn is_post_seen(&self, post_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        super::queries::is_post_seen(&conn, post_id)
    }

    async fn set_post_state(&self, post_id: &str, state: PostState) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::set_post_state(&conn, post_id, state)
    }

    async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let conn = self.conn.lock().await;
        super::queries::get_post(&conn, post_id)
    }

    async fn get_unfinished_posts(&self) -> Result<Vec<Post>> {
        let conn = self.conn.lock().await;
        super::queries::get_unfinished_posts(&conn)
    }

    async fn count_posts_by_state(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().await;
        super::queries::count_posts_by_state(&conn)
    }

    async fn insert_enrichment_attempt(&self, result: &EnrichmentResult) -> Result<i64> {
        let conn = self.conn.lock().await;
        super::queries::insert_enrichment_attempt(&conn, result)
    }

    async fn latest_enrichment(&self, post_id: &str) -> Result<Option<EnrichmentResult>> {
        let conn = self.conn.lock().await;
        super::queries::latest_enrichment(&conn, post_id)
    }

    async fn count_enrichment_attempts(&self, post_id: &str) -> Result<u32> {
        let conn = self.conn.lock().await;
        super::queries::count_enrichment_attempts(&conn, post_id)
    }

    async fn start_delivery(&self, post_id: &str) -> Result<DeliveryRecord> {
        let conn = self.conn.lock().await;
        super::queries::start_delivery(&conn, post_id)
    }

    async fn record_delivery_attempt(
        &self,
        post_id: &str,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::record_delivery_attempt(&conn, post_id, attempts, error)
    }

    async fn complete_delivery(
        &self,
        post_id: &str,
        attempts: u32,
        message_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::complete_delivery(&conn, post_id, attempts, message_id)
    }

    async fn fail_delivery(&self, post_id: &str, attempts: u32, error: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::fail_delivery(&conn, post_id, attempts, error)
    }

    async fn get_delivery(&self, post_id: &str) -> Result<Option<DeliveryRecord>> {
        let conn = self.conn.lock().await;
        super::queries::get_delivery(&conn, post_id)
    }

    async fn recent_delivery_failures(&self, limit: u32) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn.lock().await;
        super::queries::recent_delivery_failures(&conn, limit)
    }

    async fn count_deliveries_by_status(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().await;
        super::queries::count_deliveries_by_status(&conn)
    }
}

// Database trait: async interface for everything the pipeline persists.
//
// Implementor: SqliteDatabase (wraps rusqlite behind a tokio Mutex). All
// methods are async so a natively async backend could slot in later without
// touching callers.

use anyhow::Result;
use async_trait::async_trait;

use super::models::{Channel, DeliveryRecord, EnrichmentResult, Post, PostState};

#[async_trait]
pub trait Database: Send + Sync {
    // --- Lifecycle ---

    /// Count the number of user-created tables in the database.
    async fn table_count(&self) -> Result<i64>;

    // --- Scan state ---

    async fn get_scan_state(&self, key: &str) -> Result<Option<String>>;

    async fn set_scan_state(&self, key: &str, value: &str) -> Result<()>;

    async fn get_all_scan_state(&self) -> Result<Vec<(String, String)>>;

    // --- Seen posts ---

    /// Atomic insert-if-absent. `true` means this call recorded the post.
    async fn insert_seen_post(&self, post: &Post, channel: Channel, state: PostState)
        -> Result<bool>;

    async fn is_post_seen(&self, post_id: &str) -> Result<bool>;

    async fn set_post_state(&self, post_id: &str, state: PostState) -> Result<()>;

    async fn get_post(&self, post_id: &str) -> Result<Option<Post>>;

    /// Accepted posts without a terminal state, oldest first.
    async fn get_unfinished_posts(&self) -> Result<Vec<Post>>;

    async fn count_posts_by_state(&self) -> Result<Vec<(String, i64)>>;

    // --- Enrichment ---

    async fn insert_enrichment_attempt(&self, result: &EnrichmentResult) -> Result<i64>;

    async fn latest_enrichment(&self, post_id: &str) -> Result<Option<EnrichmentResult>>;

    async fn count_enrichment_attempts(&self, post_id: &str) -> Result<u32>;

    // --- Delivery ---

    /// Create the pending delivery record if needed; returns the current one.
    async fn start_delivery(&self, post_id: &str) -> Result<DeliveryRecord>;

    async fn record_delivery_attempt(
        &self,
        post_id: &str,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<()>;

    async fn complete_delivery(
        &self,
        post_id: &str,
        attempts: u32,
        message_id: Option<&str>,
    ) -> Result<()>;

    async fn fail_delivery(&self, post_id: &str, attempts: u32, error: &str) -> Result<()>;

    async fn get_delivery(&self, post_id: &str) -> Result<Option<DeliveryRecord>>;

    async fn recent_delivery_failures(&self, limit: u32) -> Result<Vec<DeliveryRecord>>;

    async fn count_deliveries_by_status(&self) -> Result<Vec<(String, i64)>>;
}

// Dedup store: the durable set of post identifiers ever accepted.
//
// Persistence lives in the `seen_posts` table; an in-memory set in front of
// it answers repeated lookups for hot identifiers without a database round
// trip. The set is only filled after the durable write succeeds, so a cache
// hit always implies a stored row.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::db::models::{Channel, Post, PostState};
use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};

pub struct DedupStore {
    db: Arc<dyn Database>,
    cache: Mutex<HashSet<String>>,
}

impl DedupStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            cache: Mutex::new(HashSet::new()),
        }
    }

    /// Whether the identifier has ever been recorded.
    pub async fn has_seen(&self, post_id: &str) -> PipelineResult<bool> {
        if self.cached(post_id) {
            return Ok(true);
        }
        let seen = self
            .db
            .is_post_seen(post_id)
            .await
            .map_err(PipelineError::storage)?;
        if seen {
            self.remember(post_id);
        }
        Ok(seen)
    }

    /// Record the identifier. Calling this twice for the same id is a no-op.
    pub async fn mark_seen(&self, post: &Post, channel: Channel) -> PipelineResult<()> {
        self.try_accept(post, channel).await.map(|_| ())
    }

    /// Atomically check-and-record. Exactly one caller per identifier gets
    /// `true`, across both ingestion channels and concurrent tasks.
    ///
    /// The row is written in the `accepted` state, carrying the full post so
    /// recovery can re-enqueue it after a crash.
    pub async fn try_accept(&self, post: &Post, channel: Channel) -> PipelineResult<bool> {
        if self.cached(&post.id) {
            debug!(post_id = %post.id, channel = channel.as_str(), "Duplicate (cached)");
            return Ok(false);
        }

        let inserted = self
            .db
            .insert_seen_post(post, channel, PostState::Accepted)
            .await
            .map_err(PipelineError::storage)?;

        self.remember(&post.id);
        if !inserted {
            debug!(post_id = %post.id, channel = channel.as_str(), "Duplicate");
        }
        Ok(inserted)
    }

    fn cached(&self, post_id: &str) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(post_id)
    }

    fn remember(&self, post_id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(post_id.to_string());
    }
}

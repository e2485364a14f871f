// Ingestion router: the merge point for both channels.
//
// Every candidate, webhook or polling, goes through `submit`: the dedup
// store decides accepted vs duplicate, the accepted post is marked queued in
// storage, then pushed onto the bounded enrichment queue. When the queue is
// full `submit` waits instead of dropping, so callers feel the backpressure.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::stats::PipelineStats;
use crate::db::models::{Channel, Post, PostState};
use crate::db::Database;
use crate::dedup::DedupStore;
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Duplicate,
}

#[derive(Clone)]
pub struct IngestRouter {
    dedup: Arc<DedupStore>,
    db: Arc<dyn Database>,
    queue: mpsc::Sender<Post>,
    stats: Arc<PipelineStats>,
}

impl IngestRouter {
    pub fn new(
        dedup: Arc<DedupStore>,
        db: Arc<dyn Database>,
        queue: mpsc::Sender<Post>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            dedup,
            db,
            queue,
            stats,
        }
    }

    /// Gate one candidate and, if new, hand it to the enrichment pool.
    ///
    /// A storage error means nothing was accepted and the caller should
    /// surface it. `Shutdown` after acceptance leaves the post `queued` in
    /// storage; recovery picks it up on the next start.
    pub async fn submit(&self, mut post: Post, channel: Channel) -> PipelineResult<Admission> {
        if !self.dedup.try_accept(&post, channel).await? {
            PipelineStats::incr(&self.stats.duplicates);
            return Ok(Admission::Duplicate);
        }
        PipelineStats::incr(&self.stats.accepted);

        // Queued before the send: a worker may pick it up immediately
        self.db
            .set_post_state(&post.id, PostState::Queued)
            .await
            .map_err(PipelineError::storage)?;
        post.state = PostState::Queued;

        debug!(
            post_id = %post.id,
            account = %post.account_key(),
            channel = channel.as_str(),
            "Accepted"
        );
        self.enqueue(post).await?;
        Ok(Admission::Accepted)
    }

    /// Push an already-accepted post (used by crash recovery).
    pub async fn enqueue(&self, post: Post) -> PipelineResult<()> {
        match self.queue.try_send(post) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(post)) => {
                PipelineStats::incr(&self.stats.backpressure_waits);
                warn!(
                    post_id = %post.id,
                    capacity = self.queue.max_capacity(),
                    "Enrichment queue full, waiting"
                );
                self.queue
                    .send(post)
                    .await
                    .map_err(|_| PipelineError::Shutdown)
            }
            Err(TrySendError::Closed(_)) => Err(PipelineError::Shutdown),
        }
    }

    /// Free slots left in the enrichment queue.
    pub fn queue_headroom(&self) -> usize {
        self.queue.capacity()
    }
}

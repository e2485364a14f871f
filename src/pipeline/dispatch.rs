// Notification dispatcher: delivers enriched posts to the messaging channel.
//
// Each post gets one delivery record. Transient failures retry with backoff
// up to the ceiling; the record ends `delivered` or `failed` and the post's
// state follows. Dispatchers drain their queue until every sender is gone,
// which is how in-flight work finishes during shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::enrich::EnrichedPost;
use super::stats::{PipelineStats, Stage};
use crate::db::models::{DeliveryStatus, PostState};
use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::notify::render::render_message;
use crate::notify::Notifier;
use crate::retry::{retry_with_backoff, RetryOutcome, RetryPolicy};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Deadline for a single send.
    pub attempt_timeout: Duration,
}

pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    db: Arc<dyn Database>,
    stats: Arc<PipelineStats>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        db: Arc<dyn Database>,
        stats: Arc<PipelineStats>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            notifier,
            db,
            stats,
            settings,
        }
    }

    /// Deliver one post and record the terminal outcome.
    ///
    /// Returns the final delivery status. Only storage failures are errors.
    pub async fn dispatch(&self, item: EnrichedPost) -> PipelineResult<DeliveryStatus> {
        let post_id = item.post.id.as_str();
        let record = self
            .db
            .start_delivery(post_id)
            .await
            .map_err(PipelineError::storage)?;

        if record.status.is_terminal() {
            debug!(post_id, status = record.status.as_str(), "Delivery already settled, skipping");
            let state = match record.status {
                DeliveryStatus::Delivered => PostState::Delivered,
                _ => PostState::DeliveryFailed,
            };
            self.db
                .set_post_state(post_id, state)
                .await
                .map_err(PipelineError::storage)?;
            return Ok(record.status);
        }

        self.db
            .set_post_state(post_id, PostState::Dispatching)
            .await
            .map_err(PipelineError::storage)?;

        let message = render_message(&item.post, item.enrichment.as_ref(), &item.media);
        let message = &message;
        let prior = record.attempts;

        let outcome = retry_with_backoff(&self.settings.retry, "delivery", move |attempt| async move {
            let result = match tokio::time::timeout(
                self.settings.attempt_timeout,
                self.notifier.send(message),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::transient(format!(
                    "delivery timed out after {}s",
                    self.settings.attempt_timeout.as_secs_f32()
                ))),
            };

            if let Err(e) = &result {
                self.db
                    .record_delivery_attempt(post_id, prior + attempt, Some(&e.to_string()))
                    .await
                    .map_err(PipelineError::storage)?;
                if e.is_retryable() {
                    PipelineStats::incr(&self.stats.delivery_retries);
                }
            }
            result
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                self.db
                    .complete_delivery(post_id, prior + attempts, value.message_id.as_deref())
                    .await
                    .map_err(PipelineError::storage)?;
                self.db
                    .set_post_state(post_id, PostState::Delivered)
                    .await
                    .map_err(PipelineError::storage)?;
                PipelineStats::incr(&self.stats.delivered);
                info!(
                    post_id,
                    account = %item.post.account_key(),
                    attempts,
                    message_id = value.message_id.as_deref().unwrap_or(""),
                    "Delivered"
                );
                Ok(DeliveryStatus::Delivered)
            }
            RetryOutcome::Exhausted {
                error: PipelineError::Storage(message),
                ..
            } => Err(PipelineError::Storage(message)),
            RetryOutcome::Exhausted { error, attempts } => {
                let reason = error.to_string();
                self.db
                    .fail_delivery(post_id, prior + attempts, &reason)
                    .await
                    .map_err(PipelineError::storage)?;
                self.db
                    .set_post_state(post_id, PostState::DeliveryFailed)
                    .await
                    .map_err(PipelineError::storage)?;
                PipelineStats::incr(&self.stats.delivery_failed);
                self.stats
                    .record_error(Stage::Delivery, format!("post {post_id}: {reason}"));
                warn!(post_id, attempts, error = %reason, kind = error.kind(), "Delivery failed");
                Ok(DeliveryStatus::Failed)
            }
        }
    }

    /// Start the dispatch workers. They exit once the queue is closed and
    /// drained.
    pub fn spawn(self: &Arc<Self>, queue: mpsc::Receiver<EnrichedPost>) -> Vec<JoinHandle<()>> {
        let queue = Arc::new(Mutex::new(queue));
        (0..self.settings.workers.max(1))
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { dispatcher.run_worker(worker, queue).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, queue: Arc<Mutex<mpsc::Receiver<EnrichedPost>>>) {
        loop {
            let next = queue.lock().await.recv().await;
            let Some(item) = next else { break };

            let post_id = item.post.id.clone();
            if let Err(e) = self.dispatch(item).await {
                error!(worker, post_id = %post_id, error = %e, "Dispatch aborted");
                self.stats
                    .record_error(Stage::Delivery, format!("post {post_id}: {e}"));
            }
        }
        info!(worker, "Dispatcher stopped");
    }
}

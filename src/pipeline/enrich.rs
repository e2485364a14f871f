// Enrichment worker pool: AI analysis plus media retrieval.
//
// A fixed number of workers drain the shared queue. For each post the
// analysis call and the media downloads run concurrently. Analysis retries
// with backoff; every attempt is stored, and when attempts run out the post
// is marked EnrichmentFailed and still forwarded to dispatch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stats::{PipelineStats, Stage};
use crate::analysis::{AnalysisRequest, Analyzer};
use crate::db::models::{EnrichmentResult, MediaReference, Post, PostState};
use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::media::MediaFetcher;
use crate::retry::{retry_with_backoff, RetryOutcome, RetryPolicy};

#[derive(Debug, Clone)]
pub struct EnrichSettings {
    pub workers: usize,
    pub instructions: String,
    pub max_tokens: u32,
    /// Deadline for a single analysis attempt.
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
    /// Deadline for a single media download.
    pub media_timeout: Duration,
    pub media_concurrency: usize,
}

/// A post ready for dispatch.
#[derive(Debug, Clone)]
pub struct EnrichedPost {
    pub post: Post,
    /// Latest analysis attempt, if any was made.
    pub enrichment: Option<EnrichmentResult>,
    /// Media that were retrieved; failed downloads are left out.
    pub media: Vec<MediaReference>,
}

pub struct EnrichmentPool {
    analyzer: Arc<dyn Analyzer>,
    fetcher: Arc<dyn MediaFetcher>,
    db: Arc<dyn Database>,
    stats: Arc<PipelineStats>,
    settings: EnrichSettings,
}

impl EnrichmentPool {
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        fetcher: Arc<dyn MediaFetcher>,
        db: Arc<dyn Database>,
        stats: Arc<PipelineStats>,
        settings: EnrichSettings,
    ) -> Self {
        Self {
            analyzer,
            fetcher,
            db,
            stats,
            settings,
        }
    }

    /// Enrich one post. Only a storage failure is returned as an error;
    /// analysis and media failures end up in the result.
    pub async fn enrich(&self, mut post: Post) -> PipelineResult<EnrichedPost> {
        self.db
            .set_post_state(&post.id, PostState::Enriching)
            .await
            .map_err(PipelineError::storage)?;

        let started = Instant::now();
        let (enrichment, media) =
            tokio::join!(self.analyze_with_retry(&post), self.fetch_media(&post));
        let enrichment = enrichment?;
        PipelineStats::add(
            &self.stats.enrichment_ms_total,
            started.elapsed().as_millis() as u64,
        );

        let state = if enrichment.success {
            PipelineStats::incr(&self.stats.enriched);
            PostState::Enriched
        } else {
            PipelineStats::incr(&self.stats.enrichment_failed);
            self.stats.record_error(
                Stage::Enrichment,
                format!(
                    "post {}: {}",
                    post.id,
                    enrichment.error.as_deref().unwrap_or("unknown error")
                ),
            );
            warn!(
                post_id = %post.id,
                attempts = enrichment.attempt,
                error = enrichment.error.as_deref().unwrap_or(""),
                "Enrichment failed, dispatching without analysis"
            );
            PostState::EnrichmentFailed
        };

        self.db
            .set_post_state(&post.id, state)
            .await
            .map_err(PipelineError::storage)?;
        post.state = state;

        Ok(EnrichedPost {
            post,
            enrichment: Some(enrichment),
            media,
        })
    }

    /// Run the analysis with retries, storing one record per attempt.
    /// Returns the record that ends the sequence.
    async fn analyze_with_retry(&self, post: &Post) -> PipelineResult<EnrichmentResult> {
        // Attempt numbers keep climbing across restarts so the latest wins
        let prior = self
            .db
            .count_enrichment_attempts(&post.id)
            .await
            .map_err(PipelineError::storage)?;

        let request = AnalysisRequest {
            text: post.text.clone(),
            instructions: self.settings.instructions.clone(),
            max_tokens: self.settings.max_tokens,
        };
        let request = &request;
        let post_id = post.id.as_str();

        let outcome = retry_with_backoff(&self.settings.retry, "ai_analysis", move |attempt| async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(
                self.settings.attempt_timeout,
                self.analyzer.analyze(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::transient(format!(
                    "analysis timed out after {}s",
                    self.settings.attempt_timeout.as_secs_f32()
                ))),
            };

            let record = match &result {
                Ok(analysis) => EnrichmentResult {
                    post_id: post_id.to_string(),
                    attempt: prior + attempt,
                    success: true,
                    analysis: Some(analysis.text.clone()),
                    model: Some(analysis.model.clone()),
                    usage: analysis.usage,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: None,
                    created_at: Utc::now().to_rfc3339(),
                },
                Err(e) => EnrichmentResult {
                    post_id: post_id.to_string(),
                    attempt: prior + attempt,
                    success: false,
                    analysis: None,
                    model: Some(self.analyzer.model().to_string()),
                    usage: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                    created_at: Utc::now().to_rfc3339(),
                },
            };
            self.db
                .insert_enrichment_attempt(&record)
                .await
                .map_err(PipelineError::storage)?;

            result.map(|_| record)
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                debug!(post_id, attempts, "Analysis complete");
                Ok(value)
            }
            RetryOutcome::Exhausted {
                error: PipelineError::Storage(message),
                ..
            } => Err(PipelineError::Storage(message)),
            RetryOutcome::Exhausted { error, attempts } => {
                let latest = self
                    .db
                    .latest_enrichment(post_id)
                    .await
                    .map_err(PipelineError::storage)?;
                Ok(latest.unwrap_or_else(|| EnrichmentResult {
                    post_id: post_id.to_string(),
                    attempt: prior + attempts,
                    success: false,
                    analysis: None,
                    model: Some(self.analyzer.model().to_string()),
                    usage: None,
                    duration_ms: 0,
                    error: Some(error.to_string()),
                    created_at: Utc::now().to_rfc3339(),
                }))
            }
        }
    }

    /// Download every media item concurrently, at most `media_concurrency`
    /// at a time. Failures are logged and dropped; the result keeps the
    /// post's original media order.
    async fn fetch_media(&self, post: &Post) -> Vec<MediaReference> {
        if post.media.is_empty() {
            return Vec::new();
        }

        let permits = Semaphore::new(self.settings.media_concurrency.max(1));
        let downloads = post
            .media
            .iter()
            .enumerate()
            .map(|(index, media)| self.fetch_one(post, index, media, &permits));

        join_all(downloads).await.into_iter().flatten().collect()
    }

    async fn fetch_one(
        &self,
        post: &Post,
        index: usize,
        media: &MediaReference,
        permits: &Semaphore,
    ) -> Option<MediaReference> {
        let _permit = permits.acquire().await.ok()?;

        let result = match tokio::time::timeout(
            self.settings.media_timeout,
            self.fetcher.fetch(&post.id, index, media),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::transient("media download timed out")),
        };

        match result {
            Ok(path) => {
                PipelineStats::incr(&self.stats.media_fetched);
                Some(media.resolved(path))
            }
            Err(e) => {
                PipelineStats::incr(&self.stats.media_failed);
                warn!(
                    post_id = %post.id,
                    url = %media.url,
                    error = %e,
                    "Media download failed, omitting"
                );
                None
            }
        }
    }

    /// Start the workers. They share one receiver; on cancellation each
    /// finishes its current post and stops taking new ones.
    pub fn spawn(
        self: &Arc<Self>,
        queue: mpsc::Receiver<Post>,
        dispatch: mpsc::Sender<EnrichedPost>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let queue = Arc::new(Mutex::new(queue));
        (0..self.settings.workers.max(1))
            .map(|worker| {
                let pool = Arc::clone(self);
                let queue = Arc::clone(&queue);
                let dispatch = dispatch.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.run_worker(worker, queue, dispatch, cancel).await })
            })
            .collect()
    }

    async fn run_worker(
        &self,
        worker: usize,
        queue: Arc<Mutex<mpsc::Receiver<Post>>>,
        dispatch: mpsc::Sender<EnrichedPost>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = {
                let mut queue = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    post = queue.recv() => post,
                }
            };
            let Some(post) = next else { break };

            let post_id = post.id.clone();
            match self.enrich(post).await {
                Ok(enriched) => {
                    if dispatch.send(enriched).await.is_err() {
                        warn!(worker, post_id = %post_id, "Dispatch queue closed, stopping worker");
                        break;
                    }
                }
                Err(e) => {
                    // Left in its current state; recovery retries it
                    error!(worker, post_id = %post_id, error = %e, "Enrichment aborted");
                    self.stats.record_error(Stage::Enrichment, format!("post {post_id}: {e}"));
                }
            }
        }
        info!(worker, "Enrichment worker stopped");
    }
}

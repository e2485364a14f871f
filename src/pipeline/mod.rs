// Pipeline orchestration: wires the stages together and owns their tasks.
//
//   webhook ─┐
//            ├─> IngestRouter ─> [enrichment queue] ─> EnrichmentPool
//   poller ──┘        │                                     │
//                DedupStore                      [dispatch queue]
//                                                           │
//                                                      Dispatcher ─> Telegram
//
// `start` spawns the workers, replays posts left unfinished by a previous
// run, then starts pollers if the mode calls for them. `shutdown` stops
// intake at once and gives in-flight work a grace period.

pub mod dispatch;
pub mod enrich;
pub mod mode;
pub mod poller;
pub mod router;
pub mod stats;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analysis::Analyzer;
use crate::db::models::PostState;
use crate::db::Database;
use crate::dedup::DedupStore;
use crate::media::{existing_downloads, MediaFetcher};
use crate::notify::Notifier;
use crate::twitter::TimelineSource;

use dispatch::{DispatchSettings, Dispatcher};
use enrich::{EnrichSettings, EnrichedPost, EnrichmentPool};
use mode::IngestMode;
use poller::{PollSettings, Poller};
use router::IngestRouter;
use stats::PipelineStats;

/// External collaborators, each behind its trait.
pub struct PipelineDeps {
    pub db: Arc<dyn Database>,
    pub timeline: Arc<dyn TimelineSource>,
    pub analyzer: Arc<dyn Analyzer>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub mode: IngestMode,
    pub accounts: Vec<String>,
    pub queue_capacity: usize,
    pub media_dir: PathBuf,
    pub poll: PollSettings,
    pub enrich: EnrichSettings,
    pub dispatch: DispatchSettings,
    /// Period of the stats log line; `None` disables it.
    pub stats_interval: Option<Duration>,
}

/// What startup recovery found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Re-enqueued for enrichment.
    pub requeued: usize,
    /// Already enriched; sent straight to dispatch.
    pub redispatched: usize,
}

pub struct RunningPipeline {
    pub router: IngestRouter,
    pub stats: Arc<PipelineStats>,
    pub mode: IngestMode,
    pub poller: Option<Arc<Poller>>,
    pub recovered: RecoveryReport,
    cancel: CancellationToken,
    pollers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    dispatchers: Vec<JoinHandle<()>>,
    stats_logger: Option<JoinHandle<()>>,
}

/// Spawn every stage and replay unfinished work.
pub async fn start(deps: PipelineDeps, settings: PipelineSettings) -> Result<RunningPipeline> {
    let stats = Arc::new(PipelineStats::new());
    let cancel = CancellationToken::new();
    let capacity = settings.queue_capacity.max(1);

    let (queue_tx, queue_rx) = mpsc::channel::<crate::db::models::Post>(capacity);
    let (dispatch_tx, dispatch_rx) = mpsc::channel::<EnrichedPost>(capacity);

    let dedup = Arc::new(DedupStore::new(deps.db.clone()));
    let router = IngestRouter::new(dedup, deps.db.clone(), queue_tx, stats.clone());

    let pool = Arc::new(EnrichmentPool::new(
        deps.analyzer,
        deps.fetcher,
        deps.db.clone(),
        stats.clone(),
        settings.enrich.clone(),
    ));
    let workers = pool.spawn(queue_rx, dispatch_tx.clone(), cancel.clone());

    let dispatcher = Arc::new(Dispatcher::new(
        deps.notifier,
        deps.db.clone(),
        stats.clone(),
        settings.dispatch.clone(),
    ));
    let dispatchers = dispatcher.spawn(dispatch_rx);

    let recovered = recover(&deps.db, &router, &dispatch_tx, &settings.media_dir).await?;
    // Workers hold the remaining senders; dispatchers drain once they exit
    drop(dispatch_tx);
    if recovered != RecoveryReport::default() {
        info!(
            requeued = recovered.requeued,
            redispatched = recovered.redispatched,
            "Recovered unfinished posts"
        );
    }

    let (poller, pollers) = if settings.mode.polling_enabled() && !settings.accounts.is_empty() {
        let poller = Arc::new(Poller::new(
            deps.timeline,
            router.clone(),
            deps.db.clone(),
            stats.clone(),
            settings.poll.clone(),
        ));
        let handles = poller.spawn(&settings.accounts, cancel.clone());
        (Some(poller), handles)
    } else {
        (None, Vec::new())
    };

    let stats_logger = settings
        .stats_interval
        .map(|period| spawn_stats_logger(stats.clone(), period, cancel.clone()));

    info!(
        mode = %settings.mode,
        accounts = settings.accounts.len(),
        enrich_workers = workers.len(),
        dispatch_workers = dispatchers.len(),
        pollers = pollers.len(),
        "Pipeline started"
    );

    Ok(RunningPipeline {
        router,
        stats,
        mode: settings.mode,
        poller,
        recovered,
        cancel,
        pollers,
        workers,
        dispatchers,
        stats_logger,
    })
}

/// Replay posts a previous run accepted but never finished.
///
/// Anything past enrichment goes straight to dispatch with its stored
/// analysis; the rest is enriched again. A crash between enrichment and a
/// recorded delivery can therefore deliver a post twice, never zero times.
async fn recover(
    db: &Arc<dyn Database>,
    router: &IngestRouter,
    dispatch: &mpsc::Sender<EnrichedPost>,
    media_dir: &std::path::Path,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for mut post in db.get_unfinished_posts().await? {
        if post.state.is_past_enrichment() {
            let enrichment = db.latest_enrichment(&post.id).await?;
            let media = existing_downloads(media_dir, &post);
            dispatch
                .send(EnrichedPost {
                    post,
                    enrichment,
                    media,
                })
                .await
                .map_err(|_| anyhow::anyhow!("dispatch queue closed during recovery"))?;
            report.redispatched += 1;
        } else {
            db.set_post_state(&post.id, PostState::Queued).await?;
            post.state = PostState::Queued;
            router.enqueue(post).await?;
            report.requeued += 1;
        }
    }

    Ok(report)
}

fn spawn_stats_logger(
    stats: Arc<PipelineStats>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick fires immediately; skip it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let s = stats.snapshot();
                    info!(
                        accepted = s.accepted,
                        duplicates = s.duplicates,
                        enriched = s.enriched,
                        enrichment_failed = s.enrichment_failed,
                        delivered = s.delivered,
                        delivery_failed = s.delivery_failed,
                        poll_errors = s.poll_errors,
                        "Pipeline stats"
                    );
                }
            }
        }
    })
}

/// Wait for `handles` until `deadline`, then abort whatever is left.
async fn join_until(handles: Vec<JoinHandle<()>>, deadline: tokio::time::Instant, what: &str) {
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    if tokio::time::timeout_at(deadline, join_all(handles)).await.is_err() {
        warn!(stage = what, "Grace period expired, aborting in-flight work");
        for handle in aborts {
            handle.abort();
        }
    }
}

impl RunningPipeline {
    /// Number of live per-account polling tasks.
    pub fn polling_tasks(&self) -> usize {
        self.pollers.iter().filter(|h| !h.is_finished()).count()
    }

    /// Token cancelled when shutdown begins; the web server listens on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop intake now; let enrichment and dispatch finish within `grace`.
    pub async fn shutdown(self, grace: Duration) {
        info!(grace_secs = grace.as_secs(), "Shutting down pipeline");
        self.cancel.cancel();

        // Pollers stop at the next await point
        join_all(self.pollers).await;
        if let Some(logger) = self.stats_logger {
            let _ = logger.await;
        }
        // Drop our queue sender so idle workers are not kept alive by it
        drop(self.router);

        let deadline = tokio::time::Instant::now() + grace;
        join_until(self.workers, deadline, "enrichment").await;
        join_until(self.dispatchers, deadline, "dispatch").await;

        let s = self.stats.snapshot();
        info!(
            accepted = s.accepted,
            delivered = s.delivered,
            delivery_failed = s.delivery_failed,
            "Pipeline stopped"
        );
    }
}

// Polling scheduler: pulls each tracked account's timeline on an interval.
//
// Per account: Idle → Fetching → Idle, once every CHECK_INTERVAL. A cold
// start (no watermark, or a watermark older than the backfill window)
// paginates back HISTORICAL_HOURS; later cycles stop at the watermark.
// Accounts run as independent tasks, and a shared semaphore caps how many
// fetch at once so one slow account cannot stall the rest.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::router::{Admission, IngestRouter};
use super::stats::{PipelineStats, Stage};
use crate::db::models::{Channel, Post};
use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::twitter::TimelineSource;

/// Hard ceiling on pages per cycle, whatever the upstream claims.
pub const DEFAULT_MAX_PAGES: u32 = 20;

/// Slack subtracted from the fetch time when advancing a quiet watermark,
/// for posts the upstream indexes a little late.
const WATERMARK_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub historical_window: chrono::Duration,
    pub max_pages: u32,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Fetching,
}

/// Why pagination stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStop {
    LastPage,
    EmptyPage,
    MissingCursor,
    RepeatedCursor,
    WindowExhausted,
    PageCeiling,
}

/// Everything one cycle pulled from upstream, before routing.
#[derive(Debug, Clone)]
pub struct CollectedWindow {
    /// Posts newer than the boundary, oldest first, unique by id.
    pub candidates: Vec<Post>,
    pub boundary: DateTime<Utc>,
    pub backfill: bool,
    pub pages: u32,
    pub rejected: usize,
    pub stop: PageStop,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub pages: u32,
    pub candidates: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub backfill: bool,
}

pub struct Poller {
    source: Arc<dyn TimelineSource>,
    router: IngestRouter,
    db: Arc<dyn Database>,
    stats: Arc<PipelineStats>,
    settings: PollSettings,
    permits: Arc<Semaphore>,
    phases: Mutex<HashMap<String, PollPhase>>,
}

fn watermark_key(account: &str) -> String {
    format!("last_seen:{}", account.to_lowercase())
}

fn last_poll_key(account: &str) -> String {
    format!("last_poll:{}", account.to_lowercase())
}

impl Poller {
    pub fn new(
        source: Arc<dyn TimelineSource>,
        router: IngestRouter,
        db: Arc<dyn Database>,
        stats: Arc<PipelineStats>,
        settings: PollSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            source,
            router,
            db,
            stats,
            settings,
            permits,
            phases: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self, account: &str) -> PollPhase {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account.to_lowercase())
            .copied()
            .unwrap_or(PollPhase::Idle)
    }

    fn set_phase(&self, account: &str, phase: PollPhase) {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.to_lowercase(), phase);
    }

    async fn watermark(&self, account: &str) -> PipelineResult<Option<DateTime<Utc>>> {
        let raw = self
            .db
            .get_scan_state(&watermark_key(account))
            .await
            .map_err(PipelineError::storage)?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Fetch everything newer than the account's boundary without routing it.
    ///
    /// Also backs the read-only `poll-once` command.
    pub async fn collect(&self, account: &str) -> PipelineResult<CollectedWindow> {
        let fetched_at = Utc::now();
        let window_start = fetched_at - self.settings.historical_window;
        let (boundary, backfill) = match self.watermark(account).await? {
            Some(mark) if mark >= window_start => (mark, false),
            _ => (window_start, true),
        };

        let mut candidates: Vec<Post> = Vec::new();
        let mut ids: HashSet<String> = HashSet::new();
        let mut cursors: HashSet<String> = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;
        let mut rejected = 0usize;

        let stop = loop {
            if pages >= self.settings.max_pages {
                warn!(account, pages, "Page ceiling reached, stopping pagination");
                break PageStop::PageCeiling;
            }

            let page = self
                .source
                .fetch_timeline_page(account, cursor.as_deref())
                .await?;
            pages += 1;
            rejected += page.rejected;
            PipelineStats::add(&self.stats.polled, page.posts.len() as u64);

            if page.posts.is_empty() {
                break PageStop::EmptyPage;
            }

            let oldest_on_page = page.posts.iter().map(|p| p.created_at).min();
            for post in page.posts {
                if post.created_at >= boundary && ids.insert(post.id.clone()) {
                    candidates.push(post);
                }
            }

            if oldest_on_page.is_some_and(|oldest| oldest < boundary) {
                break PageStop::WindowExhausted;
            }
            if !page.has_next_page {
                break PageStop::LastPage;
            }
            match page.next_cursor {
                None => break PageStop::MissingCursor,
                Some(next) if !cursors.insert(next.clone()) => break PageStop::RepeatedCursor,
                Some(next) => cursor = Some(next),
            }
        };

        // Upstream pages are newest first; route oldest first
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        debug!(account, pages, candidates = candidates.len(), backfill, stop = ?stop, "Timeline collected");

        Ok(CollectedWindow {
            candidates,
            boundary,
            backfill,
            pages,
            rejected,
            stop,
            fetched_at,
        })
    }

    /// Run one full cycle for an account: collect, route, advance watermark.
    pub async fn poll_account(&self, account: &str) -> PipelineResult<PollReport> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::Shutdown)?;

        self.set_phase(account, PollPhase::Fetching);
        let result = self.run_cycle(account).await;
        self.set_phase(account, PollPhase::Idle);
        result
    }

    async fn run_cycle(&self, account: &str) -> PipelineResult<PollReport> {
        let window = self.collect(account).await?;
        let previous = self.watermark(account).await?;

        let mut report = PollReport {
            pages: window.pages,
            candidates: window.candidates.len(),
            rejected: window.rejected,
            backfill: window.backfill,
            ..Default::default()
        };

        let newest = window.candidates.last().map(|p| p.created_at);
        for post in window.candidates {
            match self.router.submit(post, Channel::Polling).await? {
                Admission::Accepted => report.accepted += 1,
                Admission::Duplicate => report.duplicates += 1,
            }
        }

        // Never move backwards; a quiet account still advances to just
        // before this fetch.
        let floor = window.fetched_at - chrono::Duration::seconds(WATERMARK_SKEW_SECS);
        let mark = [previous, newest, Some(floor)]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(floor);

        self.db
            .set_scan_state(&watermark_key(account), &mark.to_rfc3339())
            .await
            .map_err(PipelineError::storage)?;
        self.db
            .set_scan_state(&last_poll_key(account), &window.fetched_at.to_rfc3339())
            .await
            .map_err(PipelineError::storage)?;

        Ok(report)
    }

    /// One task per account, each on its own interval, until cancelled.
    pub fn spawn(
        self: &Arc<Self>,
        accounts: &[String],
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        accounts
            .iter()
            .map(|account| {
                let poller = Arc::clone(self);
                let account = account.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { poller.run_account(account, cancel).await })
            })
            .collect()
    }

    async fn run_account(&self, account: String, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.poll_account(&account) => outcome,
            };

            match outcome {
                Ok(report) => {
                    if report.accepted > 0 || report.backfill {
                        info!(
                            account = %account,
                            accepted = report.accepted,
                            duplicates = report.duplicates,
                            pages = report.pages,
                            backfill = report.backfill,
                            "Poll cycle complete"
                        );
                    } else {
                        debug!(account = %account, candidates = report.candidates, "Poll cycle complete");
                    }
                }
                Err(PipelineError::Shutdown) => break,
                Err(e) => {
                    PipelineStats::incr(&self.stats.poll_errors);
                    self.stats
                        .record_error(Stage::Polling, format!("@{account}: {e}"));
                    warn!(account = %account, error = %e, kind = e.kind(), "Poll cycle failed");
                }
            }
        }

        debug!(account = %account, "Poller stopped");
    }
}

// End-to-end pipeline tests with in-memory collaborators.
//
// Every external service (timeline API, AI analysis, media hosts, Telegram)
// is replaced by a fake behind its trait; storage is a real in-memory SQLite
// database. These exercise the behavior that only shows up when the stages
// run together: dedup across channels, backfill, retries, and recovery.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use tokio::sync::mpsc;
use tower::ServiceExt;

use tweetwatch::analysis::{Analysis, AnalysisRequest, Analyzer};
use tweetwatch::db::models::{
    Channel, DeliveryStatus, EnrichmentResult, MediaKind, MediaReference, Post, PostState,
};
use tweetwatch::db::Database;
use tweetwatch::dedup::DedupStore;
use tweetwatch::error::{PipelineError, PipelineResult};
use tweetwatch::media::MediaFetcher;
use tweetwatch::notify::{Delivery, Notifier, OutgoingMessage};
use tweetwatch::pipeline::dispatch::DispatchSettings;
use tweetwatch::pipeline::enrich::EnrichSettings;
use tweetwatch::pipeline::mode::IngestMode;
use tweetwatch::pipeline::poller::{PageStop, PollSettings, Poller};
use tweetwatch::pipeline::router::{Admission, IngestRouter};
use tweetwatch::pipeline::stats::PipelineStats;
use tweetwatch::pipeline::{self, PipelineDeps, PipelineSettings, RunningPipeline};
use tweetwatch::retry::RetryPolicy;
use tweetwatch::twitter::{TimelinePage, TimelineSource};
use tweetwatch::web::{self, WebhookState, WEBHOOK_PATH};

// ============================================================
// Fakes
// ============================================================

#[derive(Clone, Copy)]
enum Cursors {
    /// Single page, no more data.
    None,
    /// Claims another page forever, with a fresh cursor each time.
    Fresh,
    /// Claims another page forever, always with the same cursor.
    Same,
}

struct FakeTimeline {
    posts: Mutex<HashMap<String, Vec<Post>>>,
    cursors: Cursors,
    calls: AtomicU32,
}

impl FakeTimeline {
    fn new(cursors: Cursors) -> Self {
        Self {
            posts: Mutex::new(HashMap::new()),
            cursors,
            calls: AtomicU32::new(0),
        }
    }

    fn with(self, account: &str, posts: Vec<Post>) -> Self {
        self.posts.lock().unwrap().insert(account.to_string(), posts);
        self
    }
}

#[async_trait]
impl TimelineSource for FakeTimeline {
    async fn fetch_timeline_page(
        &self,
        account: &str,
        _cursor: Option<&str>,
    ) -> PipelineResult<TimelinePage> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut posts = self
            .posts
            .lock()
            .unwrap()
            .get(account)
            .cloned()
            .unwrap_or_default();
        // Newest first, like the upstream
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let (has_next_page, next_cursor) = match self.cursors {
            Cursors::None => (false, None),
            Cursors::Fresh => (true, Some(format!("c{n}"))),
            Cursors::Same => (true, Some("c".to_string())),
        };
        Ok(TimelinePage {
            posts,
            has_next_page,
            next_cursor,
            rejected: 0,
        })
    }
}

struct FakeAnalyzer {
    delay: Duration,
    calls: AtomicU32,
}

impl FakeAnalyzer {
    fn instant() -> Self {
        Self::slow(Duration::ZERO)
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> PipelineResult<Analysis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Analysis {
            text: format!("summary of {}", request.text),
            model: "fake-model".to_string(),
            usage: None,
        })
    }

    fn model(&self) -> &str {
        "fake-model"
    }
}

struct NoMedia;

#[async_trait]
impl MediaFetcher for NoMedia {
    async fn fetch(&self, _: &str, _: usize, _: &MediaReference) -> PipelineResult<PathBuf> {
        Err(PipelineError::PermanentItem("no media in tests".to_string()))
    }
}

/// Stores the first item of every post; every later item is gone upstream.
struct FirstMediaOnly;

#[async_trait]
impl MediaFetcher for FirstMediaOnly {
    async fn fetch(&self, post_id: &str, index: usize, _: &MediaReference) -> PipelineResult<PathBuf> {
        if index == 0 {
            Ok(PathBuf::from(format!("/media/{post_id}_{index}.jpg")))
        } else {
            Err(PipelineError::PermanentItem("media returned 404".to_string()))
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<OutgoingMessage>>,
    /// Number of leading calls that fail with a transient error.
    fail_first: AtomicU32,
    calls: AtomicU32,
}

impl RecordingNotifier {
    fn failing(times: u32) -> Self {
        Self {
            fail_first: AtomicU32::new(times),
            ..Default::default()
        }
    }

    fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &OutgoingMessage) -> PipelineResult<Delivery> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first.load(Ordering::SeqCst) {
            return Err(PipelineError::transient("telegram returned 502"));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(Delivery {
            message_id: Some(format!("m{n}")),
        })
    }
}

// ============================================================
// Helpers
// ============================================================

fn post(id: &str, handle: &str, minutes_ago: i64) -> Post {
    Post {
        id: id.to_string(),
        author_id: format!("id-{handle}"),
        author_handle: handle.to_string(),
        text: format!("post {id} from {handle}"),
        created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        url: None,
        media: vec![],
        like_count: 0,
        repost_count: 0,
        reply_count: 0,
        state: PostState::default(),
    }
}

fn settings(mode: IngestMode, accounts: &[&str]) -> PipelineSettings {
    PipelineSettings {
        mode,
        accounts: accounts.iter().map(|s| s.to_string()).collect(),
        queue_capacity: 16,
        media_dir: std::env::temp_dir().join("tweetwatch-test-media"),
        poll: PollSettings {
            // One cycle at startup; later cycles are driven by the test
            interval: Duration::from_secs(3600),
            historical_window: chrono::Duration::hours(2),
            max_pages: 5,
            concurrency: 2,
        },
        enrich: EnrichSettings {
            workers: 2,
            instructions: "Summarize.".to_string(),
            max_tokens: 100,
            attempt_timeout: Duration::from_secs(5),
            retry: RetryPolicy::immediate(3),
            media_timeout: Duration::from_secs(1),
            media_concurrency: 2,
        },
        dispatch: DispatchSettings {
            workers: 1,
            retry: RetryPolicy::immediate(3),
            attempt_timeout: Duration::from_secs(5),
        },
        stats_interval: None,
    }
}

struct Harness {
    db: Arc<dyn Database>,
    analyzer: Arc<FakeAnalyzer>,
    fetcher: Arc<dyn MediaFetcher>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    fn new(analyzer: FakeAnalyzer, notifier: RecordingNotifier) -> Self {
        Self {
            db: tweetwatch::db::open_in_memory().unwrap(),
            analyzer: Arc::new(analyzer),
            fetcher: Arc::new(NoMedia),
            notifier: Arc::new(notifier),
        }
    }

    fn with_fetcher(mut self, fetcher: impl MediaFetcher + 'static) -> Self {
        self.fetcher = Arc::new(fetcher);
        self
    }

    async fn start(&self, timeline: FakeTimeline, settings: PipelineSettings) -> RunningPipeline {
        let deps = PipelineDeps {
            db: self.db.clone(),
            timeline: Arc::new(timeline),
            analyzer: self.analyzer.clone(),
            fetcher: self.fetcher.clone(),
            notifier: self.notifier.clone(),
        };
        pipeline::start(deps, settings).await.unwrap()
    }
}

/// Wait until `n` posts have reached a terminal delivery outcome.
async fn wait_for_settled(stats: &PipelineStats, n: u64) {
    for _ in 0..500 {
        let s = stats.snapshot();
        if s.delivered + s.delivery_failed >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let s = stats.snapshot();
    panic!(
        "timed out waiting for {n} settled posts (delivered {}, failed {})",
        s.delivered, s.delivery_failed
    );
}

// ============================================================
// Polling
// ============================================================

#[tokio::test]
async fn cold_start_backfills_then_finds_nothing_new() {
    let harness = Harness::new(FakeAnalyzer::instant(), RecordingNotifier::default());
    let timeline = FakeTimeline::new(Cursors::None).with(
        "alice",
        vec![
            post("3", "alice", 10),
            post("1", "alice", 30),
            post("2", "alice", 20),
            // Outside the two-hour window
            post("0", "alice", 300),
        ],
    );
    let mut cfg = settings(IngestMode::PollingOnly, &["alice"]);
    cfg.enrich.workers = 1;
    let running = harness.start(timeline, cfg).await;

    wait_for_settled(&running.stats, 3).await;

    let texts: Vec<String> = harness.notifier.sent().iter().map(|m| m.text.clone()).collect();
    assert_eq!(texts.len(), 3);
    // Oldest first
    assert!(texts[0].contains("post 1"));
    assert!(texts[1].contains("post 2"));
    assert!(texts[2].contains("post 3"));
    assert!(texts[0].contains("summary of post 1"));
    assert!(!harness.db.is_post_seen("0").await.unwrap());

    let poller = running.poller.clone().expect("polling enabled");
    let report = poller.poll_account("alice").await.unwrap();
    assert_eq!(report.accepted, 0, "second cycle must not accept anything");
    assert!(!report.backfill);

    running.shutdown(Duration::from_secs(5)).await;
    assert_eq!(harness.notifier.sent().len(), 3);
    assert!(harness
        .db
        .get_scan_state("last_seen:alice")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn endless_pagination_stops_at_page_ceiling() {
    let db = tweetwatch::db::open_in_memory().unwrap();
    let stats = Arc::new(PipelineStats::new());
    let (tx, _rx) = mpsc::channel(4);
    let router = IngestRouter::new(Arc::new(DedupStore::new(db.clone())), db.clone(), tx, stats.clone());
    let timeline = Arc::new(FakeTimeline::new(Cursors::Fresh).with("bob", vec![post("9", "bob", 5)]));
    let cfg = settings(IngestMode::PollingOnly, &["bob"]);
    let poller = Poller::new(timeline.clone(), router, db, stats, cfg.poll.clone());

    let window = poller.collect("bob").await.unwrap();

    assert_eq!(window.stop, PageStop::PageCeiling);
    assert_eq!(window.pages, cfg.poll.max_pages);
    assert_eq!(timeline.calls.load(Ordering::SeqCst), cfg.poll.max_pages);
    // The same post on every page is a single candidate
    assert_eq!(window.candidates.len(), 1);
    assert!(window.backfill);
}

#[tokio::test]
async fn repeated_cursor_stops_pagination() {
    let db = tweetwatch::db::open_in_memory().unwrap();
    let stats = Arc::new(PipelineStats::new());
    let (tx, _rx) = mpsc::channel(4);
    let router = IngestRouter::new(Arc::new(DedupStore::new(db.clone())), db.clone(), tx, stats.clone());
    let timeline = Arc::new(FakeTimeline::new(Cursors::Same).with("bob", vec![post("9", "bob", 5)]));
    let poller = Poller::new(
        timeline.clone(),
        router,
        db,
        stats,
        settings(IngestMode::PollingOnly, &[]).poll,
    );

    let window = poller.collect("bob").await.unwrap();

    assert_eq!(window.stop, PageStop::RepeatedCursor);
    assert_eq!(window.pages, 2);
}

#[tokio::test]
async fn no_webhook_url_means_polling_only() {
    let mode = IngestMode::resolve(true, false, None);
    assert_eq!(mode, IngestMode::PollingOnly);
    assert!(!mode.webhook_enabled());

    let harness = Harness::new(FakeAnalyzer::instant(), RecordingNotifier::default());
    let timeline = FakeTimeline::new(Cursors::None);
    let running = harness.start(timeline, settings(mode, &["alice", "bob"])).await;

    assert_eq!(running.mode, IngestMode::PollingOnly);
    assert_eq!(running.polling_tasks(), 2);
    running.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn webhook_only_mode_starts_no_pollers() {
    let harness = Harness::new(FakeAnalyzer::instant(), RecordingNotifier::default());
    let timeline = FakeTimeline::new(Cursors::None).with("alice", vec![post("1", "alice", 5)]);
    let running = harness
        .start(timeline, settings(IngestMode::WebhookOnly, &["alice"]))
        .await;

    assert!(running.poller.is_none());
    assert_eq!(running.polling_tasks(), 0);
    running.shutdown(Duration::from_secs(5)).await;
    assert!(harness.notifier.sent().is_empty());
}

// ============================================================
// Cross-channel dedup
// ============================================================

fn webhook_body(p: &Post) -> String {
    serde_json::json!({
        "event_type": "tweet",
        "rule_tag": "tweetwatch-1",
        "tweets": [{
            "id": p.id,
            "text": p.text,
            "createdAt": p.created_at.format("%a %b %d %H:%M:%S %z %Y").to_string(),
            "author": {"id": p.author_id, "userName": p.author_handle}
        }]
    })
    .to_string()
}

#[tokio::test]
async fn same_post_from_webhook_and_poll_is_delivered_once() {
    let harness = Harness::new(FakeAnalyzer::instant(), RecordingNotifier::default());
    let shared = post("100", "alice", 3);
    let timeline = FakeTimeline::new(Cursors::None).with("alice", vec![shared.clone()]);
    let running = harness
        .start(timeline, settings(IngestMode::Hybrid, &["alice"]))
        .await;

    let app = web::build_router(Some(WebhookState {
        router: running.router.clone(),
        secret: Arc::from("s3cret"),
        stats: running.stats.clone(),
    }));
    let request = Request::post(WEBHOOK_PATH)
        .header("content-type", "application/json")
        .header("x-webhook-secret", "s3cret")
        .body(Body::from(webhook_body(&shared)))
        .unwrap();
    let poller = running.poller.clone().expect("hybrid polls");

    let (response, report) = tokio::join!(app.oneshot(request), poller.poll_account("alice"));
    assert_eq!(response.unwrap().status(), StatusCode::OK);
    report.unwrap();

    wait_for_settled(&running.stats, 1).await;
    // Give a stray second delivery the chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.notifier.sent().len(), 1);
    assert_eq!(running.stats.snapshot().accepted, 1);
    let delivery = harness.db.get_delivery("100").await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempts, 1);

    running.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn concurrent_submissions_accept_exactly_one() {
    let harness = Harness::new(FakeAnalyzer::instant(), RecordingNotifier::default());
    let running = harness
        .start(FakeTimeline::new(Cursors::None), settings(IngestMode::WebhookOnly, &[]))
        .await;

    let p = post("7", "carol", 1);
    let submissions = (0..8).map(|i| {
        let router = running.router.clone();
        let p = p.clone();
        let channel = if i % 2 == 0 { Channel::Webhook } else { Channel::Polling };
        tokio::spawn(async move { router.submit(p, channel).await })
    });
    let results = futures::future::join_all(submissions).await;

    let accepted = results
        .into_iter()
        .filter(|r| matches!(r.as_ref().unwrap(), Ok(Admission::Accepted)))
        .count();
    assert_eq!(accepted, 1);

    wait_for_settled(&running.stats, 1).await;
    running.shutdown(Duration::from_secs(5)).await;
    assert_eq!(harness.notifier.sent().len(), 1);
}

// ============================================================
// Enrichment and delivery failures
// ============================================================

#[tokio::test]
async fn analysis_timeouts_still_deliver_without_analysis() {
    let harness = Harness::new(
        FakeAnalyzer::slow(Duration::from_secs(2)),
        RecordingNotifier::default(),
    );
    let mut cfg = settings(IngestMode::WebhookOnly, &[]);
    cfg.enrich.attempt_timeout = Duration::from_millis(20);
    let running = harness.start(FakeTimeline::new(Cursors::None), cfg).await;

    let admission = running
        .router
        .submit(post("55", "dave", 1), Channel::Webhook)
        .await
        .unwrap();
    assert_eq!(admission, Admission::Accepted);

    wait_for_settled(&running.stats, 1).await;

    assert_eq!(harness.analyzer.calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.db.count_enrichment_attempts("55").await.unwrap(), 3);
    let latest = harness.db.latest_enrichment("55").await.unwrap().unwrap();
    assert!(!latest.success);
    assert!(latest.error.unwrap().contains("timed out"));

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.contains("post 55"));
    assert!(!sent[0].text.contains("summary of"));

    let stored = harness.db.get_post("55").await.unwrap().unwrap();
    assert_eq!(stored.state, PostState::Delivered);
    assert_eq!(running.stats.snapshot().enrichment_failed, 1);

    running.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn transient_delivery_failures_are_retried() {
    let harness = Harness::new(FakeAnalyzer::instant(), RecordingNotifier::failing(2));
    let running = harness
        .start(FakeTimeline::new(Cursors::None), settings(IngestMode::WebhookOnly, &[]))
        .await;

    running
        .router
        .submit(post("60", "erin", 1), Channel::Webhook)
        .await
        .unwrap();
    wait_for_settled(&running.stats, 1).await;

    let delivery = harness.db.get_delivery("60").await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempts, 3);
    assert_eq!(delivery.message_id.as_deref(), Some("m2"));
    assert_eq!(running.stats.snapshot().delivery_retries, 2);

    running.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn exhausted_delivery_is_recorded_as_failed() {
    let harness = Harness::new(FakeAnalyzer::instant(), RecordingNotifier::failing(u32::MAX));
    let running = harness
        .start(FakeTimeline::new(Cursors::None), settings(IngestMode::WebhookOnly, &[]))
        .await;

    running
        .router
        .submit(post("61", "erin", 1), Channel::Webhook)
        .await
        .unwrap();
    wait_for_settled(&running.stats, 1).await;

    let delivery = harness.db.get_delivery("61").await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 3);
    assert!(delivery.last_error.unwrap().contains("502"));
    let stored = harness.db.get_post("61").await.unwrap().unwrap();
    assert_eq!(stored.state, PostState::DeliveryFailed);
    assert_eq!(harness.db.recent_delivery_failures(10).await.unwrap().len(), 1);

    running.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn failed_media_item_is_left_out_of_delivery() {
    let harness = Harness::new(FakeAnalyzer::instant(), RecordingNotifier::default())
        .with_fetcher(FirstMediaOnly);
    let running = harness
        .start(FakeTimeline::new(Cursors::None), settings(IngestMode::WebhookOnly, &[]))
        .await;

    let mut with_media = post("62", "erin", 1);
    with_media.media = vec![
        MediaReference::new(MediaKind::Image, "https://pbs.example/media/a.jpg"),
        MediaReference::new(MediaKind::Image, "https://pbs.example/media/b.jpg"),
    ];
    running.router.submit(with_media, Channel::Webhook).await.unwrap();
    wait_for_settled(&running.stats, 1).await;

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].attachments.len(), 1);
    assert_eq!(sent[0].attachments[0].path, PathBuf::from("/media/62_0.jpg"));
    let stats = running.stats.snapshot();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.media_fetched, 1);
    assert_eq!(stats.media_failed, 1);
    let stored = harness.db.get_post("62").await.unwrap().unwrap();
    assert_eq!(stored.state, PostState::Delivered);

    running.shutdown(Duration::from_secs(5)).await;
}

// ============================================================
// Recovery
// ============================================================

#[tokio::test]
async fn startup_recovers_unfinished_posts() {
    let harness = Harness::new(FakeAnalyzer::instant(), RecordingNotifier::default());
    let db = harness.db.clone();

    // Accepted but never enriched
    db.insert_seen_post(&post("a", "alice", 5), Channel::Polling, PostState::Queued)
        .await
        .unwrap();
    // Enriched before the crash; must not be analyzed again
    db.insert_seen_post(&post("b", "alice", 4), Channel::Webhook, PostState::Enriched)
        .await
        .unwrap();
    db.insert_enrichment_attempt(&EnrichmentResult {
        post_id: "b".to_string(),
        attempt: 1,
        success: true,
        analysis: Some("stored analysis".to_string()),
        model: Some("fake-model".to_string()),
        usage: None,
        duration_ms: 12,
        error: None,
        created_at: Utc::now().to_rfc3339(),
    })
    .await
    .unwrap();
    // Delivered, but the crash hit before the state was updated
    db.insert_seen_post(&post("c", "alice", 3), Channel::Polling, PostState::Dispatching)
        .await
        .unwrap();
    db.start_delivery("c").await.unwrap();
    db.complete_delivery("c", 1, Some("m-old")).await.unwrap();

    let running = harness
        .start(FakeTimeline::new(Cursors::None), settings(IngestMode::WebhookOnly, &[]))
        .await;
    assert_eq!(running.recovered.requeued, 1);
    assert_eq!(running.recovered.redispatched, 2);

    wait_for_settled(&running.stats, 2).await;
    running.shutdown(Duration::from_secs(5)).await;

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 2, "the already-delivered post must not be resent");
    assert!(sent.iter().any(|m| m.text.contains("stored analysis")));
    assert_eq!(harness.analyzer.calls.load(Ordering::SeqCst), 1);

    for id in ["a", "b", "c"] {
        let stored = db.get_post(id).await.unwrap().unwrap();
        assert_eq!(stored.state, PostState::Delivered, "post {id}");
    }
    assert!(db.get_unfinished_posts().await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_leaves_queued_posts_for_recovery() {
    let harness = Harness::new(
        FakeAnalyzer::slow(Duration::from_millis(200)),
        RecordingNotifier::default(),
    );
    let mut cfg = settings(IngestMode::WebhookOnly, &[]);
    cfg.enrich.workers = 1;
    let running = harness.start(FakeTimeline::new(Cursors::None), cfg).await;

    for i in 0..4 {
        running
            .router
            .submit(post(&format!("q{i}"), "frank", 1), Channel::Webhook)
            .await
            .unwrap();
    }
    running.shutdown(Duration::from_secs(5)).await;

    // Whatever was not delivered is still on record as unfinished
    let delivered = harness.notifier.sent().len();
    let unfinished = harness.db.get_unfinished_posts().await.unwrap().len();
    assert_eq!(delivered + unfinished, 4);
    assert!(unfinished >= 1, "shutdown should not drain the whole queue");
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use tweetwatch::analysis::{Analyzer, DisabledAnalyzer, OpenAiAnalyzer};
use tweetwatch::config::Config;
use tweetwatch::db::Database;
use tweetwatch::dedup::DedupStore;
use tweetwatch::media::HttpMediaFetcher;
use tweetwatch::notify::TelegramNotifier;
use tweetwatch::pipeline::poller::Poller;
use tweetwatch::pipeline::router::IngestRouter;
use tweetwatch::pipeline::stats::PipelineStats;
use tweetwatch::pipeline::{self, PipelineDeps};
use tweetwatch::rate_limit::RateLimiter;
use tweetwatch::rules::{FilterRuleManager, RuleOutcome};
use tweetwatch::twitter::{RuleApi, TwitterApiClient};
use tweetwatch::web::{self, WebhookState};

/// tweetwatch: forward tweets from tracked accounts to a Telegram chat.
///
/// Tweets arrive by upstream webhook push, by periodic timeline polling, or
/// both; each one is analyzed, its media fetched, and delivered once.
#[derive(Parser)]
#[command(name = "tweetwatch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Run the pipeline and the webhook server until interrupted
    Run,

    /// Inspect or reconcile the upstream filter rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Fetch one polling window per account and show what is new, without
    /// accepting or delivering anything
    PollOnce {
        /// Only this account (default: every configured account)
        account: Option<String>,
    },

    /// Show system status (post states, deliveries, last poll per account)
    Status,
}

#[derive(Subcommand)]
enum RulesAction {
    /// List the rules registered upstream
    List,
    /// Create, update, activate, or delete rules to match TWITTER_ACCOUNTS
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    // Set up structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tweetwatch=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            info!("Initializing tweetwatch database...");
            let config = Config::load()?;
            let db = tweetwatch::db::initialize_sqlite(&config.db_path)?;
            let table_count = db.table_count().await?;
            println!("Database initialized at: {}", config.db_path);
            println!("Tables created: {table_count}");
            println!("\ntweetwatch is ready. Next step: set up your .env file");
            println!("  (see .env.example for required variables)");
            println!("\nThen run: tweetwatch run");
        }

        Commands::Run => {
            let config = Config::load()?;
            config.require_twitter()?;
            config.require_accounts()?;
            config.require_telegram()?;
            run(config).await?;
        }

        Commands::Rules { action } => {
            let config = Config::load()?;
            config.require_twitter()?;
            let client = Arc::new(twitter_client(&config)?);

            match action {
                RulesAction::List => {
                    let rules = client.list_rules().await?;
                    if rules.is_empty() {
                        println!("No filter rules registered upstream.");
                        return Ok(());
                    }
                    println!("  {:<20} {:<24} {:>8}  {}", "Rule ID", "Tag", "Interval", "Value");
                    println!("  {}", "-".repeat(80));
                    for rule in &rules {
                        let tag = if rule.active {
                            rule.tag.green().to_string()
                        } else {
                            format!("{} (inactive)", rule.tag).yellow().to_string()
                        };
                        println!(
                            "  {:<20} {:<24} {:>7}s  {}",
                            rule.rule_id, tag, rule.interval_seconds, rule.value
                        );
                    }
                }
                RulesAction::Sync => {
                    config.require_accounts()?;
                    let manager = FilterRuleManager::new(
                        client,
                        &config.rule_tag_prefix,
                        config.rule_interval_seconds,
                    );
                    println!(
                        "Reconciling filter rules for {} account(s)...",
                        config.accounts.len()
                    );
                    let report = manager.reconcile(&config.accounts).await?;
                    for outcome in &report.outcomes {
                        print_rule_outcome(outcome);
                    }
                    if report.failures() > 0 {
                        anyhow::bail!("{} rule(s) failed to reconcile", report.failures());
                    }
                    println!("\n{}", "Filter rules in sync.".bold());
                }
            }
        }

        Commands::PollOnce { account } => {
            let config = Config::load()?;
            config.require_twitter()?;
            let accounts = match account {
                Some(a) => tweetwatch::config::parse_accounts(&a),
                None => {
                    config.require_accounts()?;
                    config.accounts.clone()
                }
            };
            let db = tweetwatch::db::open_sqlite(&config.db_path)?;
            poll_once(&config, db, &accounts).await?;
        }

        Commands::Status => {
            let config = Config::load()?;
            let db = tweetwatch::db::open_sqlite(&config.db_path)?;
            tweetwatch::status::show(&db, &config.db_path).await?;
        }
    }

    Ok(())
}

/// Long-running mode: pipeline plus HTTP server, until Ctrl-C.
async fn run(config: Config) -> Result<()> {
    if (config.hybrid_mode || config.webhook_only) && config.webhook_url.is_none() {
        warn!("Webhook mode requested but WEBHOOK_URL is not set; running polling-only");
    }
    let mode = config.ingest_mode();
    if mode.webhook_enabled() {
        config.require_webhook_secret()?;
    }

    // `run` may be the first command on a fresh deployment
    let db = tweetwatch::db::initialize_sqlite(&config.db_path)?;
    let client = Arc::new(twitter_client(&config)?);

    if mode.webhook_enabled() {
        let manager = FilterRuleManager::new(
            client.clone(),
            &config.rule_tag_prefix,
            config.rule_interval_seconds,
        );
        // The webhook still accepts pushes for rules that already exist
        match manager.reconcile(&config.accounts).await {
            Ok(report) if report.failures() > 0 => {
                warn!(failures = report.failures(), "Some filter rules failed to reconcile")
            }
            Ok(report) => info!(rules = report.outcomes.len(), "Filter rules reconciled"),
            Err(e) => warn!(error = %e, "Could not list filter rules; skipping reconcile"),
        }
    }

    let analyzer: Arc<dyn Analyzer> = if config.ai_api_key.is_empty() {
        warn!("AI_API_KEY not set; posts will be delivered without analysis");
        Arc::new(DisabledAnalyzer)
    } else {
        Arc::new(OpenAiAnalyzer::new(
            &config.ai_base_url,
            &config.ai_api_key,
            &config.ai_model,
            config.ai_timeout,
        )?)
    };

    let deps = PipelineDeps {
        db,
        timeline: client,
        analyzer,
        fetcher: Arc::new(HttpMediaFetcher::new(
            config.media_dir.clone(),
            config.media_timeout,
            config.media_max_bytes,
        )?),
        notifier: Arc::new(TelegramNotifier::new(
            &config.telegram_api_url,
            &config.telegram_bot_token,
            &config.telegram_chat_id,
            config.http_timeout,
        )?),
    };

    let running = pipeline::start(deps, config.pipeline_settings(mode)).await?;
    println!(
        "{} mode {}, {} account(s), {} polling task(s)",
        "tweetwatch running:".bold(),
        running.mode,
        config.accounts.len(),
        running.polling_tasks()
    );

    let webhook = mode.webhook_enabled().then(|| WebhookState {
        router: running.router.clone(),
        secret: Arc::from(config.webhook_secret.as_str()),
        stats: running.stats.clone(),
    });
    let app = web::build_router(webhook);
    let cancel = running.cancellation();
    let bind = config.bind.clone();
    let port = config.port;
    let mut server = tokio::spawn(async move { web::serve(app, &bind, port, cancel).await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Interrupt received");
        }
        result = &mut server => {
            // The server only returns early when it fails to bind or crashes
            match result {
                Ok(Ok(())) => warn!("HTTP server stopped unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
        }
    }

    let cancel = running.cancellation();
    cancel.cancel();
    if !server.is_finished() {
        let _ = server.await;
    }
    running.shutdown(config.shutdown_grace).await;
    println!("{}", "tweetwatch stopped.".bold());
    Ok(())
}

/// Read-only dry run of one polling cycle per account.
async fn poll_once(config: &Config, db: Arc<dyn Database>, accounts: &[String]) -> Result<()> {
    let client: Arc<TwitterApiClient> = Arc::new(twitter_client(config)?);
    let stats = Arc::new(PipelineStats::new());

    // The poller needs a router to exist; nothing is ever submitted to it
    let (queue_tx, _queue_rx) = mpsc::channel(1);
    let router = IngestRouter::new(
        Arc::new(DedupStore::new(db.clone())),
        db.clone(),
        queue_tx,
        stats.clone(),
    );
    let poller = Poller::new(client, router, db.clone(), stats, config.poll_settings());

    for account in accounts {
        let window = match poller.collect(account).await {
            Ok(w) => w,
            Err(e) => {
                println!("@{account}: {}", format!("Error: {e}").red());
                continue;
            }
        };

        println!(
            "\n{} {} page(s), {} candidate(s) since {}{}",
            format!("@{account}:").bold(),
            window.pages,
            window.candidates.len(),
            window.boundary.format("%Y-%m-%d %H:%M:%S UTC"),
            if window.backfill { " (backfill)" } else { "" }
        );
        if window.rejected > 0 {
            println!("  {} malformed item(s) skipped", window.rejected);
        }

        for post in &window.candidates {
            let marker = if db.is_post_seen(&post.id).await? {
                "seen".dimmed().to_string()
            } else {
                "new ".green().to_string()
            };
            println!(
                "  {} {} {}",
                marker,
                post.created_at.format("%Y-%m-%d %H:%M"),
                tweetwatch::notify::render::truncate_chars(&post.text.replace('\n', " "), 80)
            );
        }
    }

    Ok(())
}

fn twitter_client(config: &Config) -> Result<TwitterApiClient> {
    let limiter = Arc::new(RateLimiter::new(
        config.upstream_max_requests,
        config.upstream_window,
    ));
    TwitterApiClient::new(
        &config.twitter_api_base_url,
        &config.twitter_api_key,
        config.http_timeout,
        limiter,
    )
}

fn print_rule_outcome(outcome: &RuleOutcome) {
    match outcome {
        RuleOutcome::Created { tag, rule_id } => {
            println!("  {} {tag} created ({rule_id})", "+".green())
        }
        RuleOutcome::Updated { tag, rule_id } => {
            println!("  {} {tag} updated ({rule_id})", "~".yellow())
        }
        RuleOutcome::Activated { tag, rule_id } => {
            println!("  {} {tag} activated ({rule_id})", "~".yellow())
        }
        RuleOutcome::Unchanged { tag, rule_id } => {
            println!("  {} {tag} unchanged ({rule_id})", "=".dimmed())
        }
        RuleOutcome::Deleted { tag, rule_id } => {
            println!("  {} {tag} deleted ({rule_id})", "-".red())
        }
        RuleOutcome::Failed { tag, error } => {
            println!("  {} {tag}: {}", "!".red().bold(), error.red())
        }
    }
}

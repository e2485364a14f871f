use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::analysis::openai::DEFAULT_BASE_URL as DEFAULT_AI_BASE_URL;
use crate::notify::telegram::DEFAULT_API_URL as DEFAULT_TELEGRAM_API_URL;
use crate::pipeline::dispatch::DispatchSettings;
use crate::pipeline::enrich::EnrichSettings;
use crate::pipeline::mode::IngestMode;
use crate::pipeline::poller::{PollSettings, DEFAULT_MAX_PAGES};
use crate::pipeline::PipelineSettings;
use crate::retry::RetryPolicy;
use crate::twitter::client::DEFAULT_API_URL as DEFAULT_TWITTER_API_URL;

/// Shortest allowed polling interval, in seconds.
pub const MIN_CHECK_INTERVAL_SECS: u64 = 10;

/// Parallel media downloads per post.
const MEDIA_CONCURRENCY: usize = 4;

const DEFAULT_SYSTEM_PROMPT: &str = "You analyze social media posts for a monitoring channel. \
In two or three sentences, summarize what the post says, note its tone, and flag anything \
that looks like news, an announcement, or a call to action. Reply in plain text.";

/// Central configuration loaded from environment variables.
///
/// All secrets come from env vars (never hardcoded). The .env file
/// is loaded automatically at startup via dotenvy. Everything is read once;
/// changes need a restart.
#[derive(Debug, Clone)]
pub struct Config {
    // Upstream content API
    pub twitter_api_key: String,
    pub twitter_api_base_url: String,
    /// Tracked handles: `@` stripped, unique (case-insensitive), in order.
    pub accounts: Vec<String>,
    pub upstream_max_requests: u32,
    pub upstream_window: Duration,

    // Polling
    pub check_interval: Duration,
    pub historical_hours: u32,
    pub poll_concurrency: usize,

    // Mode
    pub hybrid_mode: bool,
    pub webhook_only: bool,
    pub webhook_secret: String,
    /// Public URL the upstream pushes to; `None` when unset or blank.
    pub webhook_url: Option<String>,

    // Filter rules
    pub rule_interval_seconds: u32,
    pub rule_tag_prefix: String,

    // AI analysis
    pub ai_api_key: String,
    pub ai_base_url: String,
    pub ai_model: String,
    pub ai_max_tokens: u32,
    pub ai_system_prompt: String,
    pub ai_timeout: Duration,
    pub ai_max_attempts: u32,

    // Delivery
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    pub telegram_api_url: String,
    pub delivery_max_attempts: u32,

    // Media
    pub media_dir: PathBuf,
    pub media_timeout: Duration,
    pub media_max_bytes: u64,

    // Workers and queues
    pub enrich_workers: usize,
    pub dispatch_workers: usize,
    pub queue_capacity: usize,
    pub http_timeout: Duration,
    pub shutdown_grace: Duration,
    pub stats_log_interval: Duration,

    // Storage and server
    pub db_path: String,
    pub bind: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key → value source.
    ///
    /// Missing keys take their defaults; present but unparsable values are
    /// errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let string = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let check_interval_secs: u64 = parse_or(&get, "CHECK_INTERVAL", 300)?;
        if check_interval_secs < MIN_CHECK_INTERVAL_SECS {
            anyhow::bail!(
                "CHECK_INTERVAL must be at least {MIN_CHECK_INTERVAL_SECS} seconds (got {check_interval_secs})"
            );
        }

        Ok(Self {
            twitter_api_key: string("TWITTER_API_KEY", ""),
            twitter_api_base_url: string("TWITTER_API_BASE_URL", DEFAULT_TWITTER_API_URL),
            accounts: parse_accounts(&string("TWITTER_ACCOUNTS", "")),
            upstream_max_requests: parse_or(&get, "UPSTREAM_MAX_REQUESTS", 60)?,
            upstream_window: Duration::from_secs(parse_or(&get, "UPSTREAM_WINDOW_SECS", 60)?),

            check_interval: Duration::from_secs(check_interval_secs),
            historical_hours: parse_or(&get, "HISTORICAL_HOURS", 2)?,
            poll_concurrency: parse_or(&get, "POLL_CONCURRENCY", 4)?,

            hybrid_mode: parse_bool_or(&get, "HYBRID_MODE", false)?,
            webhook_only: parse_bool_or(&get, "WEBHOOK_ONLY", false)?,
            webhook_secret: string("TWITTER_WEBHOOK_SECRET", ""),
            webhook_url: get("WEBHOOK_URL"),

            rule_interval_seconds: parse_or(&get, "RULE_INTERVAL_SECONDS", 100)?,
            rule_tag_prefix: string("RULE_TAG_PREFIX", "tweetwatch"),

            ai_api_key: string("AI_API_KEY", ""),
            ai_base_url: string("AI_BASE_URL", DEFAULT_AI_BASE_URL),
            ai_model: string("AI_MODEL", "gpt-4o-mini"),
            ai_max_tokens: parse_or(&get, "AI_MAX_TOKENS", 400)?,
            ai_system_prompt: string("AI_SYSTEM_PROMPT", DEFAULT_SYSTEM_PROMPT),
            ai_timeout: Duration::from_secs(parse_or(&get, "AI_TIMEOUT_SECS", 30)?),
            ai_max_attempts: parse_or(&get, "AI_MAX_ATTEMPTS", 3)?,

            telegram_bot_token: string("TELEGRAM_BOT_TOKEN", ""),
            telegram_chat_id: string("TELEGRAM_CHAT_ID", ""),
            telegram_api_url: string("TELEGRAM_API_URL", DEFAULT_TELEGRAM_API_URL),
            delivery_max_attempts: parse_or(&get, "DELIVERY_MAX_ATTEMPTS", 5)?,

            media_dir: PathBuf::from(string("MEDIA_DIR", "./media")),
            media_timeout: Duration::from_secs(parse_or(&get, "MEDIA_TIMEOUT_SECS", 30)?),
            media_max_bytes: parse_or(&get, "MEDIA_MAX_BYTES", 50 * 1024 * 1024)?,

            enrich_workers: parse_or(&get, "ENRICH_WORKERS", 4)?,
            dispatch_workers: parse_or(&get, "DISPATCH_WORKERS", 1)?,
            queue_capacity: parse_or(&get, "QUEUE_CAPACITY", 256)?,
            http_timeout: Duration::from_secs(parse_or(&get, "HTTP_TIMEOUT_SECS", 30)?),
            shutdown_grace: Duration::from_secs(parse_or(&get, "SHUTDOWN_GRACE_SECS", 30)?),
            stats_log_interval: Duration::from_secs(parse_or(&get, "STATS_LOG_INTERVAL", 300)?),

            db_path: string("TWEETWATCH_DB_PATH", "./tweetwatch.db"),
            bind: string("BIND", "0.0.0.0"),
            port: parse_or(&get, "PORT", 8080)?,
        })
    }

    /// Channels to run, from the mode flags and the webhook URL.
    pub fn ingest_mode(&self) -> IngestMode {
        IngestMode::resolve(self.hybrid_mode, self.webhook_only, self.webhook_url.as_deref())
    }

    /// Backfill window applied on cold start.
    pub fn historical_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.historical_hours))
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.check_interval,
            historical_window: self.historical_window(),
            max_pages: DEFAULT_MAX_PAGES,
            concurrency: self.poll_concurrency.max(1),
        }
    }

    pub fn enrich_settings(&self) -> EnrichSettings {
        EnrichSettings {
            workers: self.enrich_workers.max(1),
            instructions: self.ai_system_prompt.clone(),
            max_tokens: self.ai_max_tokens,
            attempt_timeout: self.ai_timeout,
            retry: RetryPolicy {
                max_attempts: self.ai_max_attempts,
                ..RetryPolicy::default()
            },
            media_timeout: self.media_timeout,
            media_concurrency: MEDIA_CONCURRENCY,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            workers: self.dispatch_workers.max(1),
            retry: RetryPolicy {
                max_attempts: self.delivery_max_attempts,
                ..RetryPolicy::default()
            },
            attempt_timeout: self.http_timeout,
        }
    }

    /// Everything `pipeline::start` needs, for the given mode.
    pub fn pipeline_settings(&self, mode: IngestMode) -> PipelineSettings {
        PipelineSettings {
            mode,
            accounts: self.accounts.clone(),
            queue_capacity: self.queue_capacity.max(1),
            media_dir: self.media_dir.clone(),
            poll: self.poll_settings(),
            enrich: self.enrich_settings(),
            dispatch: self.dispatch_settings(),
            stats_interval: (!self.stats_log_interval.is_zero()).then_some(self.stats_log_interval),
        }
    }

    /// Check that the upstream API key is configured.
    /// Call this before any operation that talks to the content API.
    pub fn require_twitter(&self) -> Result<()> {
        if self.twitter_api_key.is_empty() {
            anyhow::bail!(
                "TWITTER_API_KEY not set. Add it to your .env file.\n\
                 See .env.example for the required variables."
            );
        }
        Ok(())
    }

    /// Check that at least one account is tracked.
    pub fn require_accounts(&self) -> Result<()> {
        if self.accounts.is_empty() {
            anyhow::bail!(
                "TWITTER_ACCOUNTS not set. Add a comma-separated list of handles to your .env file."
            );
        }
        Ok(())
    }

    /// Check that Telegram delivery is configured.
    pub fn require_telegram(&self) -> Result<()> {
        if self.telegram_bot_token.is_empty() || self.telegram_chat_id.is_empty() {
            anyhow::bail!(
                "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must both be set.\n\
                 See .env.example for the required variables."
            );
        }
        Ok(())
    }

    /// The webhook channel needs a secret to authenticate deliveries.
    pub fn require_webhook_secret(&self) -> Result<()> {
        if self.webhook_secret.is_empty() {
            anyhow::bail!(
                "TWITTER_WEBHOOK_SECRET not set but the webhook channel is enabled.\n\
                 Set it, or unset WEBHOOK_URL to run polling-only."
            );
        }
        Ok(())
    }
}

/// Split the account list: strip `@`, drop blanks, de-duplicate
/// case-insensitively while keeping the first spelling and order.
pub fn parse_accounts(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(',')
        .map(|a| a.trim().trim_start_matches('@').trim())
        .filter(|a| !a.is_empty())
        .filter(|a| seen.insert(a.to_lowercase()))
        .map(str::to_string)
        .collect()
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{key} must be a boolean (true/false), got {raw:?}"),
        },
        None => Ok(default),
    }
}

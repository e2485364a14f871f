// Data models: the types that flow through the pipeline.
//
// These are kept separate from the database queries so the ingestion,
// enrichment, and dispatch modules can use them without depending on
// rusqlite directly.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One piece of monitored content (a tweet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Origin-assigned identifier; globally unique in the dedup store.
    pub id: String,
    pub author_id: String,
    pub author_handle: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Permalink, when the upstream provides one.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaReference>,
    /// Engagement counters, advisory only.
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub repost_count: i64,
    #[serde(default)]
    pub reply_count: i64,
    #[serde(default)]
    pub state: PostState,
}

impl Post {
    /// Lowercased handle, used as the per-account key.
    pub fn account_key(&self) -> String {
        self.author_handle.to_lowercase()
    }

    pub fn permalink(&self) -> String {
        self.url.clone().unwrap_or_else(|| {
            format!("https://x.com/{}/status/{}", self.author_handle, self.id)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// Media attached to a post. `local_path` is filled in once downloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaReference {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

impl MediaReference {
    pub fn new(kind: MediaKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            local_path: None,
        }
    }

    pub fn resolved(&self, path: PathBuf) -> Self {
        Self {
            kind: self.kind,
            url: self.url.clone(),
            local_path: Some(path),
        }
    }
}

/// Lifecycle of a post inside the pipeline.
///
/// `Candidate → Accepted | Duplicate → Queued → Enriching →
/// Enriched | EnrichmentFailed → Dispatching → Delivered | DeliveryFailed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PostState {
    #[default]
    Candidate,
    Accepted,
    Duplicate,
    Queued,
    Enriching,
    Enriched,
    EnrichmentFailed,
    Dispatching,
    Delivered,
    DeliveryFailed,
}

impl PostState {
    pub const ALL: [PostState; 10] = [
        PostState::Candidate,
        PostState::Accepted,
        PostState::Duplicate,
        PostState::Queued,
        PostState::Enriching,
        PostState::Enriched,
        PostState::EnrichmentFailed,
        PostState::Dispatching,
        PostState::Delivered,
        PostState::DeliveryFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostState::Candidate => "candidate",
            PostState::Accepted => "accepted",
            PostState::Duplicate => "duplicate",
            PostState::Queued => "queued",
            PostState::Enriching => "enriching",
            PostState::Enriched => "enriched",
            PostState::EnrichmentFailed => "enrichment_failed",
            PostState::Dispatching => "dispatching",
            PostState::Delivered => "delivered",
            PostState::DeliveryFailed => "delivery_failed",
        }
    }

    /// No further pipeline work will happen for this post.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostState::Duplicate | PostState::Delivered | PostState::DeliveryFailed
        )
    }

    /// Enrichment already ran; recovery can go straight to dispatch.
    pub fn is_past_enrichment(&self) -> bool {
        matches!(
            self,
            PostState::Enriched | PostState::EnrichmentFailed | PostState::Dispatching
        )
    }
}

impl fmt::Display for PostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PostState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown post state: {s}"))
    }
}

/// Which ingestion channel produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Webhook,
    Polling,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Webhook => "webhook",
            Channel::Polling => "polling",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One AI-analysis attempt. Never revised; a later attempt supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub post_id: String,
    pub attempt: u32,
    pub success: bool,
    pub analysis: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub duration_ms: u64,
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

/// A server-side content filter driving webhook deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub rule_id: String,
    pub tag: String,
    pub value: String,
    pub interval_seconds: u32,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delivered" => DeliveryStatus::Delivered,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

/// Delivery bookkeeping, one per post that reached dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub post_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub delivered_at: Option<String>,
    /// Message identifier returned by the messaging channel.
    pub message_id: Option<String>,
}

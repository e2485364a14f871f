// Upstream content API: per-account timelines and server-side filter rules.
//
// The pipeline talks to the upstream through two traits so the poller and
// the rule manager can be exercised against in-memory fakes.

pub mod client;
pub mod types;

use async_trait::async_trait;

use crate::db::models::{FilterRule, Post};
use crate::error::PipelineResult;

pub use client::TwitterApiClient;

/// One page of an account's timeline, newest first.
#[derive(Debug, Clone, Default)]
pub struct TimelinePage {
    pub posts: Vec<Post>,
    pub has_next_page: bool,
    pub next_cursor: Option<String>,
    /// Items on the page that failed to normalize.
    pub rejected: usize,
}

#[async_trait]
pub trait TimelineSource: Send + Sync {
    async fn fetch_timeline_page(
        &self,
        account: &str,
        cursor: Option<&str>,
    ) -> PipelineResult<TimelinePage>;
}

/// Filter-rule management. Every operation is keyed by the remote `rule_id`.
#[async_trait]
pub trait RuleApi: Send + Sync {
    async fn list_rules(&self) -> PipelineResult<Vec<FilterRule>>;

    /// Create a rule. The upstream always creates it inactive.
    async fn add_rule(&self, tag: &str, value: &str, interval_seconds: u32)
        -> PipelineResult<String>;

    /// Full replace, including the active flag, in one call.
    async fn update_rule(&self, rule: &FilterRule) -> PipelineResult<()>;

    async fn delete_rule(&self, rule_id: &str) -> PipelineResult<()>;
}

// HTTP client for the upstream content API.
//
// A thin reqwest wrapper with generic GET/POST helpers, the same shape as a
// plain XRPC client: authenticate with a header, check the status, decode
// JSON. Every request first takes a slot from the shared rate limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::types::{
    normalize_tweets, LastTweetsResponse, RuleMutationResponse, RulesResponse,
};
use super::{RuleApi, TimelinePage, TimelineSource};
use crate::db::models::FilterRule;
use crate::error::{PipelineError, PipelineResult};
use crate::rate_limit::RateLimiter;

/// Default upstream endpoint.
pub const DEFAULT_API_URL: &str = "https://api.twitterapi.io";

pub struct TwitterApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: Arc<RateLimiter>,
}

impl TwitterApiClient {
    /// Pass a different `base_url` for testing against a mock server.
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tweetwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            limiter,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> PipelineResult<T> {
        self.limiter.acquire().await;
        let url = format!("{}{}", self.base_url, path);
        debug!(path, "Upstream GET");

        let response = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .query(params)
            .send()
            .await?;
        decode(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> PipelineResult<T> {
        self.limiter.acquire().await;
        let url = format!("{}{}", self.base_url, path);
        debug!(path, "Upstream POST");

        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(body)
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> PipelineResult<T> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        return Err(match PipelineError::from_status("upstream", status, &body) {
            PipelineError::TransientUpstream { message, .. } => {
                PipelineError::TransientUpstream {
                    message,
                    retry_after,
                }
            }
            other => other,
        });
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| {
        // An unreadable success body is an upstream hiccup, not a bad item
        PipelineError::transient(format!("invalid upstream response: {e}"))
    })
}

/// The upstream reports some failures as 200 with `status: "error"`.
fn check_status(status: Option<&str>, message: Option<&str>, what: &str) -> PipelineResult<()> {
    match status {
        Some("error") => Err(PipelineError::transient(format!(
            "{what} failed: {}",
            message.unwrap_or("unknown error")
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl TimelineSource for TwitterApiClient {
    async fn fetch_timeline_page(
        &self,
        account: &str,
        cursor: Option<&str>,
    ) -> PipelineResult<TimelinePage> {
        let mut params = vec![("userName", account)];
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            params.push(("cursor", cursor));
        }

        let resp: LastTweetsResponse = self
            .get_json("/twitter/user/last_tweets", &params)
            .await?;
        check_status(
            resp.status.as_deref(),
            resp.message.as_deref(),
            "timeline fetch",
        )?;

        let has_next_page = resp.has_next_page;
        let next_cursor = resp.next_cursor.clone().filter(|c| !c.is_empty());
        let (posts, rejected) = normalize_tweets(resp.into_raw_tweets());

        Ok(TimelinePage {
            posts,
            has_next_page,
            next_cursor,
            rejected,
        })
    }
}

#[derive(Serialize)]
struct AddRuleBody<'a> {
    tag: &'a str,
    value: &'a str,
    interval_seconds: u32,
}

#[derive(Serialize)]
struct UpdateRuleBody<'a> {
    rule_id: &'a str,
    tag: &'a str,
    value: &'a str,
    interval_seconds: u32,
    is_effect: u8,
}

#[derive(Serialize)]
struct DeleteRuleBody<'a> {
    rule_id: &'a str,
}

#[async_trait]
impl RuleApi for TwitterApiClient {
    async fn list_rules(&self) -> PipelineResult<Vec<FilterRule>> {
        let resp: RulesResponse = self.get_json("/oapi/tweet_filter/get_rules", &[]).await?;
        check_status(resp.status.as_deref(), resp.msg.as_deref(), "list rules")?;
        Ok(resp.rules.into_iter().map(FilterRule::from).collect())
    }

    async fn add_rule(
        &self,
        tag: &str,
        value: &str,
        interval_seconds: u32,
    ) -> PipelineResult<String> {
        let body = AddRuleBody {
            tag,
            value,
            interval_seconds,
        };
        let resp: RuleMutationResponse = self
            .post_json("/oapi/tweet_filter/add_rule", &body)
            .await?;
        check_status(resp.status.as_deref(), resp.msg.as_deref(), "add rule")?;
        resp.rule_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PipelineError::PermanentItem(format!("add rule {tag}: no rule_id returned")))
    }

    async fn update_rule(&self, rule: &FilterRule) -> PipelineResult<()> {
        let body = UpdateRuleBody {
            rule_id: &rule.rule_id,
            tag: &rule.tag,
            value: &rule.value,
            interval_seconds: rule.interval_seconds,
            is_effect: u8::from(rule.active),
        };
        let resp: RuleMutationResponse = self
            .post_json("/oapi/tweet_filter/update_rule", &body)
            .await?;
        check_status(resp.status.as_deref(), resp.msg.as_deref(), "update rule")
    }

    async fn delete_rule(&self, rule_id: &str) -> PipelineResult<()> {
        let resp: RuleMutationResponse = self
            .post_json("/oapi/tweet_filter/delete_rule", &DeleteRuleBody { rule_id })
            .await?;
        check_status(resp.status.as_deref(), resp.msg.as_deref(), "delete rule")
    }
}

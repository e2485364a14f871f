// Wire types for the upstream content API.
//
// Field names follow the upstream JSON (camelCase for tweets, snake_case for
// pagination and rules). Everything is optional or defaulted so a partial
// payload degrades to a skipped item instead of a failed page.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::db::models::{FilterRule, MediaKind, MediaReference, Post, PostState};
use crate::error::{PipelineError, PipelineResult};

/// Upstream timestamp format, e.g. `Tue Dec 10 07:00:30 +0000 2024`.
const TWITTER_DATE_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTweet {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub retweet_count: Option<i64>,
    #[serde(default)]
    pub reply_count: Option<i64>,
    #[serde(default)]
    pub author: Option<ApiAuthor>,
    #[serde(default)]
    pub extended_entities: Option<ExtendedEntities>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAuthor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtendedEntities {
    #[serde(default)]
    pub media: Vec<ApiMedia>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiMedia {
    #[serde(rename = "type", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub media_url_https: Option<String>,
    #[serde(default)]
    pub video_info: Option<VideoInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoInfo {
    #[serde(default)]
    pub variants: Vec<VideoVariant>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoVariant {
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl ApiMedia {
    fn into_reference(self) -> Option<MediaReference> {
        match self.media_type.as_deref() {
            Some("video") | Some("animated_gif") => {
                // Highest-bitrate mp4; fall back to the still preview
                let best = self
                    .video_info
                    .into_iter()
                    .flat_map(|info| info.variants)
                    .filter(|v| v.content_type.as_deref() == Some("video/mp4"))
                    .filter_map(|v| v.url.map(|url| (v.bitrate.unwrap_or(0), url)))
                    .max_by_key(|(bitrate, _)| *bitrate);
                match best {
                    Some((_, url)) => Some(MediaReference::new(MediaKind::Video, url)),
                    None => self
                        .media_url_https
                        .map(|url| MediaReference::new(MediaKind::Image, url)),
                }
            }
            _ => self
                .media_url_https
                .map(|url| MediaReference::new(MediaKind::Image, url)),
        }
    }
}

impl ApiTweet {
    /// Normalize into the internal representation.
    ///
    /// A tweet without an id, author, or parsable timestamp is a
    /// `PermanentItem` error: the caller skips it and moves on.
    pub fn into_post(self) -> PipelineResult<Post> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PipelineError::PermanentItem("tweet without id".into()))?;

        let author = self
            .author
            .ok_or_else(|| PipelineError::PermanentItem(format!("tweet {id} has no author")))?;
        let author_handle = author
            .user_name
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PipelineError::PermanentItem(format!("tweet {id} has no author handle")))?;

        let created_at = match self.created_at.as_deref() {
            Some(raw) => parse_tweet_date(raw).ok_or_else(|| {
                PipelineError::PermanentItem(format!("tweet {id} has unparsable createdAt: {raw}"))
            })?,
            None => {
                return Err(PipelineError::PermanentItem(format!(
                    "tweet {id} has no createdAt"
                )))
            }
        };

        let media = self
            .extended_entities
            .map(|e| e.media)
            .unwrap_or_default()
            .into_iter()
            .filter_map(ApiMedia::into_reference)
            .collect();

        Ok(Post {
            id,
            author_id: author.id.unwrap_or_default(),
            author_handle,
            text: self.text.unwrap_or_default(),
            created_at,
            url: self.url,
            media,
            like_count: self.like_count.unwrap_or(0),
            repost_count: self.retweet_count.unwrap_or(0),
            reply_count: self.reply_count.unwrap_or(0),
            state: PostState::Candidate,
        })
    }
}

/// Parse the upstream date format, or RFC 3339 as a fallback.
pub fn parse_tweet_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, TWITTER_DATE_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Response of the per-account timeline endpoint.
///
/// Some deployments wrap the tweets in a `data` object; both shapes are
/// accepted.
#[derive(Debug, Default, Deserialize)]
pub struct LastTweetsResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "msg")]
    pub message: Option<String>,
    #[serde(default)]
    pub tweets: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub data: Option<LastTweetsData>,
    #[serde(default)]
    pub has_next_page: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LastTweetsData {
    #[serde(default)]
    pub tweets: Vec<serde_json::Value>,
}

impl LastTweetsResponse {
    pub fn into_raw_tweets(self) -> Vec<serde_json::Value> {
        match (self.tweets, self.data) {
            (Some(tweets), _) => tweets,
            (None, Some(data)) => data.tweets,
            (None, None) => Vec::new(),
        }
    }
}

/// Parse raw tweet values, dropping (and logging) the malformed ones.
pub fn normalize_tweets(raw: Vec<serde_json::Value>) -> (Vec<Post>, usize) {
    let mut posts = Vec::with_capacity(raw.len());
    let mut rejected = 0;
    for value in raw {
        let parsed = serde_json::from_value::<ApiTweet>(value)
            .map_err(PipelineError::from)
            .and_then(ApiTweet::into_post);
        match parsed {
            Ok(post) => posts.push(post),
            Err(e) => {
                rejected += 1;
                tracing::warn!(error = %e, "Skipping malformed tweet");
            }
        }
    }
    (posts, rejected)
}

// --- Filter rules ---

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRule {
    #[serde(alias = "id")]
    pub rule_id: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub interval_seconds: f64,
    #[serde(default)]
    pub is_effect: i64,
}

impl From<ApiRule> for FilterRule {
    fn from(rule: ApiRule) -> Self {
        FilterRule {
            rule_id: rule.rule_id,
            tag: rule.tag,
            value: rule.value,
            interval_seconds: rule.interval_seconds.max(0.0) as u32,
            active: rule.is_effect != 0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RulesResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
    #[serde(default)]
    pub rules: Vec<ApiRule>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RuleMutationResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
    #[serde(default)]
    pub rule_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    #[test]
    fn test_parse_twitter_date() {
        let dt = parse_tweet_date("Tue Dec 10 07:00:30 +0000 2024").unwrap();
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.hour(), 7);
        assert_eq!(dt.second(), 30);
    }

    #[test]
    fn test_parse_rfc3339_fallback() {
        let dt = parse_tweet_date("2024-12-10T07:00:30+02:00").unwrap();
        assert_eq!(dt.hour(), 5);
        assert!(parse_tweet_date("yesterday").is_none());
    }

    #[test]
    fn test_into_post_full_payload() {
        let tweet: ApiTweet = serde_json::from_value(json!({
            "id": "1866",
            "url": "https://x.com/alice/status/1866",
            "text": "hello world",
            "createdAt": "Tue Dec 10 07:00:30 +0000 2024",
            "likeCount": 5,
            "retweetCount": 2,
            "replyCount": 1,
            "author": {"id": "42", "userName": "Alice", "name": "Alice A"},
            "extendedEntities": {"media": [
                {"type": "photo", "media_url_https": "https://pbs.example/a.jpg"},
                {"type": "video", "media_url_https": "https://pbs.example/thumb.jpg",
                 "video_info": {"variants": [
                    {"content_type": "application/x-mpegURL", "url": "https://v.example/pl.m3u8"},
                    {"content_type": "video/mp4", "bitrate": 256000, "url": "https://v.example/low.mp4"},
                    {"content_type": "video/mp4", "bitrate": 2176000, "url": "https://v.example/high.mp4"}
                 ]}}
            ]}
        }))
        .unwrap();

        let post = tweet.into_post().unwrap();
        assert_eq!(post.id, "1866");
        assert_eq!(post.author_handle, "Alice");
        assert_eq!(post.account_key(), "alice");
        assert_eq!(post.like_count, 5);
        assert_eq!(post.repost_count, 2);
        assert_eq!(post.media.len(), 2);
        assert_eq!(post.media[0].kind, MediaKind::Image);
        assert_eq!(post.media[1].kind, MediaKind::Video);
        assert_eq!(post.media[1].url, "https://v.example/high.mp4");
        assert_eq!(post.state, PostState::Candidate);
    }

    #[test]
    fn test_into_post_rejects_missing_fields() {
        let no_id: ApiTweet = serde_json::from_value(json!({"text": "x"})).unwrap();
        assert!(matches!(
            no_id.into_post(),
            Err(PipelineError::PermanentItem(_))
        ));

        let bad_date: ApiTweet = serde_json::from_value(json!({
            "id": "1", "createdAt": "not a date", "author": {"userName": "a"}
        }))
        .unwrap();
        assert!(bad_date.into_post().is_err());
    }

    #[test]
    fn test_response_accepts_nested_data() {
        let resp: LastTweetsResponse = serde_json::from_value(json!({
            "status": "success",
            "data": {"tweets": [{"id": "1"}]},
            "has_next_page": true,
            "next_cursor": "abc"
        }))
        .unwrap();
        assert!(resp.has_next_page);
        assert_eq!(resp.next_cursor.as_deref(), Some("abc"));
        assert_eq!(resp.into_raw_tweets().len(), 1);
    }

    #[test]
    fn test_normalize_skips_malformed() {
        let (posts, rejected) = normalize_tweets(vec![
            json!({"id": "1", "createdAt": "2024-01-01T00:00:00Z", "author": {"userName": "a"}}),
            json!({"id": 7}),
            json!("garbage"),
        ]);
        assert_eq!(posts.len(), 1);
        assert_eq!(rejected, 2);
    }

    #[test]
    fn test_api_rule_conversion() {
        let rule: ApiRule = serde_json::from_value(json!({
            "rule_id": "r1", "tag": "tweetwatch-1", "value": "from:alice",
            "interval_seconds": 100.0, "is_effect": 1
        }))
        .unwrap();
        let rule = FilterRule::from(rule);
        assert!(rule.active);
        assert_eq!(rule.interval_seconds, 100);
    }
}

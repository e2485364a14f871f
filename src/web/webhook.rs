// POST /webhook/twitter: push deliveries from the upstream filter rules.
//
// The handler authenticates, parses, and routes; it returns as soon as the
// posts are accepted into the enrichment queue; enrichment and delivery run
// later. Individual malformed tweets are skipped; an unparsable body, or one
// where every tweet is malformed, is 400.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::api_error;
use super::auth::verify_delivery;
use crate::db::models::Channel;
use crate::error::PipelineError;
use crate::pipeline::router::{Admission, IngestRouter};
use crate::pipeline::stats::PipelineStats;
use crate::twitter::types::normalize_tweets;

/// Upstream's connectivity probe when a webhook URL is registered.
const TEST_EVENT: &str = "test_webhook_url";

#[derive(Clone)]
pub struct WebhookState {
    pub router: IngestRouter,
    pub secret: Arc<str>,
    pub stats: Arc<PipelineStats>,
}

#[derive(Debug, Default, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    pub received: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// The tweet values carried by a delivery.
///
/// Accepts `{"event_type": ..., "tweets": [...]}`, a bare array, or a single
/// tweet object. `None` means the body has none of those shapes.
pub fn extract_tweets(payload: Value) -> Option<Vec<Value>> {
    match payload {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            if let Some(tweets) = map.remove("tweets") {
                return match tweets {
                    Value::Array(items) => Some(items),
                    Value::Null => Some(Vec::new()),
                    _ => None,
                };
            }
            if map.contains_key("id") {
                return Some(vec![Value::Object(map)]);
            }
            // Event envelope with no tweets (e.g. the registration probe)
            map.contains_key("event_type").then(Vec::new)
        }
        _ => None,
    }
}

pub async fn receive(
    State(state): State<WebhookState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(failure) = verify_delivery(&state.secret, &headers, &query, &body) {
        PipelineStats::incr(&state.stats.webhook_rejected);
        warn!(reason = failure.as_str(), "Webhook delivery rejected");
        return api_error(StatusCode::UNAUTHORIZED, failure.as_str());
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            PipelineStats::incr(&state.stats.webhook_rejected);
            warn!(error = %e, "Webhook body is not JSON");
            return api_error(StatusCode::BAD_REQUEST, "body is not valid JSON");
        }
    };

    if payload.get("event_type").and_then(Value::as_str) == Some(TEST_EVENT) {
        info!("Webhook test delivery received");
        return (
            StatusCode::OK,
            Json(WebhookAck {
                status: "ok",
                ..Default::default()
            }),
        )
            .into_response();
    }

    let Some(raw) = extract_tweets(payload) else {
        PipelineStats::incr(&state.stats.webhook_rejected);
        warn!("Webhook body has no tweets");
        return api_error(StatusCode::BAD_REQUEST, "body carries no tweets");
    };

    let received = raw.len();
    PipelineStats::add(&state.stats.webhook_received, received as u64);
    let (posts, rejected) = normalize_tweets(raw);
    if received > 0 && posts.is_empty() {
        PipelineStats::incr(&state.stats.webhook_rejected);
        warn!(rejected, "Webhook delivery has no usable tweets");
        return api_error(StatusCode::BAD_REQUEST, "no tweet in the body could be parsed");
    }

    let mut ack = WebhookAck {
        status: "ok",
        received,
        rejected,
        ..Default::default()
    };

    for post in posts {
        let post_id = post.id.clone();
        match state.router.submit(post, Channel::Webhook).await {
            Ok(Admission::Accepted) => ack.accepted += 1,
            Ok(Admission::Duplicate) => ack.duplicates += 1,
            Err(PipelineError::Shutdown) => {
                return api_error(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
            }
            Err(e) => {
                // Storage trouble: make the upstream retry the delivery
                warn!(post_id = %post_id, error = %e, "Webhook post could not be routed");
                return api_error(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable");
            }
        }
    }

    debug!(
        received = ack.received,
        accepted = ack.accepted,
        duplicates = ack.duplicates,
        rejected = ack.rejected,
        "Webhook delivery processed"
    );
    (StatusCode::OK, Json(ack)).into_response()
}

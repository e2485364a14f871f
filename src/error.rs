// Pipeline error taxonomy.
//
// Everything that flows through the ingestion → enrichment → dispatch path
// reports failures as a `PipelineError`, so the retry loop and the per-item
// terminal states can decide what to do from the variant alone. Startup and
// CLI code stays on anyhow and converts at the edges.

use std::time::Duration;

use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad signature or rejected credentials. Fatal to the one request only.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Timeouts, 5xx, rate limiting. Retried with backoff.
    #[error("transient upstream error: {message}")]
    TransientUpstream {
        message: String,
        /// Server-provided hint (Retry-After, Telegram `retry_after`).
        retry_after: Option<Duration>,
    },

    /// Malformed payload, unresolvable media. The item is skipped.
    #[error("item error: {0}")]
    PermanentItem(String),

    /// A bounded queue is full or closed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Dedup store / database failure. Never swallowed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The pipeline is shutting down and no longer takes work.
    #[error("pipeline is shutting down")]
    Shutdown,
}

impl PipelineError {
    pub fn transient(message: impl Into<String>) -> Self {
        PipelineError::TransientUpstream {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        PipelineError::Storage(format!("{err:#}"))
    }

    /// Only transient upstream failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientUpstream { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PipelineError::TransientUpstream { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(service: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("{service} returned {status}: {}", preview(body));
        match status.as_u16() {
            401 | 403 => PipelineError::Auth(message),
            408 | 425 | 429 => PipelineError::transient(message),
            s if s >= 500 => PipelineError::transient(message),
            _ => PipelineError::PermanentItem(message),
        }
    }

    /// Short name used as a metric/log label.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Auth(_) => "auth",
            PipelineError::TransientUpstream { .. } => "transient_upstream",
            PipelineError::PermanentItem(_) => "permanent_item",
            PipelineError::ResourceExhausted(_) => "resource_exhausted",
            PipelineError::Storage(_) => "storage",
            PipelineError::Shutdown => "shutdown",
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            PipelineError::transient(err.to_string())
        } else if let Some(status) = err.status() {
            PipelineError::from_status("upstream", status, &err.to_string())
        } else if err.is_decode() || err.is_body() {
            PipelineError::PermanentItem(format!("invalid response body: {err}"))
        } else {
            PipelineError::transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::PermanentItem(format!("invalid JSON: {err}"))
    }
}

fn preview(body: &str) -> String {
    body.chars().take(300).collect()
}

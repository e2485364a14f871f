// Ingestion mode: which channels feed the router.
//
// Resolved once at startup from the config flags. Everything downstream
// asks the mode what to wire instead of re-reading the flags.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Webhook and polling both feed the router.
    Hybrid,
    WebhookOnly,
    PollingOnly,
}

impl IngestMode {
    /// Without a public webhook URL nothing can push to us, so the result is
    /// polling-only whatever was requested.
    pub fn resolve(hybrid: bool, webhook_only: bool, webhook_url: Option<&str>) -> Self {
        let has_url = webhook_url.is_some_and(|u| !u.trim().is_empty());
        match (has_url, webhook_only, hybrid) {
            (false, _, _) => IngestMode::PollingOnly,
            (true, true, _) => IngestMode::WebhookOnly,
            (true, false, true) => IngestMode::Hybrid,
            (true, false, false) => IngestMode::PollingOnly,
        }
    }

    pub fn polling_enabled(&self) -> bool {
        matches!(self, IngestMode::Hybrid | IngestMode::PollingOnly)
    }

    pub fn webhook_enabled(&self) -> bool {
        matches!(self, IngestMode::Hybrid | IngestMode::WebhookOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestMode::Hybrid => "hybrid",
            IngestMode::WebhookOnly => "webhook-only",
            IngestMode::PollingOnly => "polling-only",
        }
    }
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// OpenAI-compatible chat completions analyzer.
//
// One request per post: a system message carrying the configured
// instructions and a user message carrying the post text, bounded by
// `max_tokens`. Works against OpenAI itself or any compatible gateway.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{Analysis, AnalysisRequest, Analyzer};
use crate::db::models::TokenUsage;
use crate::error::{PipelineError, PipelineResult};
use crate::notify::render::truncate_chars;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAnalyzer {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiAnalyzer {
    /// `timeout` bounds the whole HTTP exchange; the enrichment pool puts its
    /// own per-attempt deadline on top.
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> PipelineResult<Analysis> {
        let mut messages = Vec::with_capacity(2);
        if !request.instructions.is_empty() {
            messages.push(WireMessage {
                role: "system",
                content: &request.instructions,
            });
        }
        messages.push(WireMessage {
            role: "user",
            content: &request.text,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("AI service", status, &body));
        }

        let raw = response.text().await?;
        let parsed: ChatResponse = serde_json::from_str(&raw).map_err(|e| {
            // Malformed responses are usually a gateway hiccup; worth a retry
            PipelineError::transient(format!("malformed AI response: {e}"))
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PipelineError::transient("AI response contained no text"))?;

        debug!(
            model = %self.model,
            preview = %truncate_chars(&text, 60),
            "Analysis generated"
        );

        Ok(Analysis {
            text,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// --- Chat completions request/response types ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

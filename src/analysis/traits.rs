// Analyzer trait: the swap-ready abstraction over the AI-analysis service.
//
// The default implementation talks to any OpenAI-compatible chat endpoint.
// The enrichment pool only sees this trait, so tests can plug in fakes that
// time out or fail on demand.

use async_trait::async_trait;

use crate::db::models::TokenUsage;
use crate::error::PipelineResult;

/// Input for one analysis call.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub text: String,
    /// System instructions; empty means none.
    pub instructions: String,
    /// Ceiling on generated tokens.
    pub max_tokens: u32,
}

/// Generated analysis plus what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub text: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> PipelineResult<Analysis>;

    /// Model identifier recorded on failed attempts.
    fn model(&self) -> &str;
}

/// Analyzer used when no AI key is configured. Every call fails permanently,
/// so posts go straight to `EnrichmentFailed` and are still dispatched.
pub struct DisabledAnalyzer;

#[async_trait]
impl Analyzer for DisabledAnalyzer {
    async fn analyze(&self, _request: &AnalysisRequest) -> PipelineResult<Analysis> {
        Err(crate::error::PipelineError::PermanentItem(
            "AI analysis is not configured (set AI_API_KEY)".into(),
        ))
    }

    fn model(&self) -> &str {
        "disabled"
    }
}

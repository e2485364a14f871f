// AI analysis: generates the commentary attached to each post.
//
// Uses the Analyzer trait so the provider can be swapped without touching
// the enrichment pool.

pub mod openai;
pub mod traits;

pub use openai::OpenAiAnalyzer;
pub use traits::{Analysis, AnalysisRequest, Analyzer, DisabledAnalyzer};

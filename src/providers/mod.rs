//! AI provider abstraction for error analysis.
//!
//! A provider turns error context into an explanation and a suggested
//! fix. The default implementation speaks the OpenAI-compatible chat
//! completions protocol; test doubles substitute via the trait.

pub mod openai;

pub use openai::OpenAiProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Context handed to a provider for one analysis
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    /// Exception type name
    pub exception_type: String,
    /// Exception message
    pub message: String,
    /// Size-bounded textual rendering of the frames
    pub frames_text: String,
    /// Model identifier to use
    pub model: String,
}

/// A provider's answer for one analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAnalysis {
    /// What is happening and why
    pub explanation: String,
    /// Concrete change to fix it
    pub suggested_fix: String,
}

/// Error types for provider operations
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("malformed response from {provider}: {message}")]
    Malformed { provider: String, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("API error from {provider}: {message}")]
    Api { provider: String, message: String },

    #[error("API key is not configured")]
    MissingApiKey,
}

/// Capability: turn error context into an explanation and fix.
///
/// Implementations must not retry internally; a failed analysis simply
/// renders as absent and retries are the caller's decision.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Provider name for display and logs
    fn name(&self) -> &'static str;

    /// Model identifier requests are sent with
    fn model_name(&self) -> &str;

    /// Perform one analysis
    async fn complete(&self, request: &AnalysisRequest) -> Result<ProviderAnalysis, ProviderError>;
}

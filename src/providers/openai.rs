//! OpenAI-compatible chat completions provider.
//!
//! Works against api.openai.com or any endpoint speaking the same
//! protocol. Responses are requested as strict JSON so the explanation
//! and fix come back machine-readable.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{AnalysisProvider, AnalysisRequest, ProviderAnalysis, ProviderError};
use crate::config::AiConfig;

/// Controls randomness in analysis responses; low keeps explanations
/// reproducible across cache misses for the same error
const TEMPERATURE: f32 = 0.3;

/// System prompt for error analysis
const SYSTEM_PROMPT: &str = "You are an expert Rust developer helping with debugging. \
Provide clear, concise explanations of errors and practical suggestions for fixing them.";

/// OpenAI-compatible provider
pub struct OpenAiProvider {
    /// HTTP client
    client: Client,
    /// API key
    api_key: String,
    /// Model to use
    model: String,
    /// Base URL (e.g. `https://api.openai.com/v1`)
    base_url: String,
    /// Request timeout, also reported in timeout errors
    timeout: Duration,
}

impl OpenAiProvider {
    /// Create a new provider
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        if api_key.is_empty() {
            return Err(ProviderError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Create from an AI configuration section
    pub fn from_config(config: &AiConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().ok_or(ProviderError::MissingApiKey)?;
        Self::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Build the request body, pinning the response to a strict schema
    fn build_request(&self, content: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            temperature: TEMPERATURE,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: content.to_string(),
                },
            ],
            response_format: ResponseFormat {
                kind: "json_schema".to_string(),
                json_schema: JsonSchemaFormat {
                    name: "error_analysis".to_string(),
                    description: "Error analysis response".to_string(),
                    strict: true,
                    schema: serde_json::json!({
                        "type": "object",
                        "properties": {
                            "explanation": { "type": "string" },
                            "suggested_fix": { "type": "string" }
                        },
                        "required": ["explanation", "suggested_fix"],
                        "additionalProperties": false
                    }),
                },
            },
        }
    }

    /// Format the user prompt from error context
    fn format_input(&self, request: &AnalysisRequest) -> String {
        let mut input = format!(
            "Error analysis request. Please analyze this error and provide:\n\
             1. A clear explanation of what's happening\n\
             2. A suggested fix\n\n\
             Exception Type: {}\n\
             Error Message: {}\n",
            request.exception_type, request.message
        );
        if !request.frames_text.is_empty() {
            input.push_str("\nStack frames (most relevant first):\n");
            input.push_str(&request.frames_text);
        }
        input.push_str("\nRespond as JSON with 'explanation' and 'suggested_fix' keys.");
        input
    }
}

#[async_trait]
impl AnalysisProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "OpenAI"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &AnalysisRequest) -> Result<ProviderAnalysis, ProviderError> {
        let input = self.format_input(request);
        let body = self.build_request(&input);

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        seconds: self.timeout.as_secs(),
                    }
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::Auth {
                    provider: "OpenAI".to_string(),
                    message: format!("HTTP {}: {}", status, error_body),
                },
                429 => ProviderError::RateLimited {
                    provider: "OpenAI".to_string(),
                },
                _ => ProviderError::Api {
                    provider: "OpenAI".to_string(),
                    message: format!("HTTP {}: {}", status, error_body),
                },
            });
        }

        let response_body: ChatCompletionResponse =
            response.json().await.map_err(|e| ProviderError::Malformed {
                provider: "OpenAI".to_string(),
                message: e.to_string(),
            })?;

        let content = response_body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|m| m.content)
            .ok_or_else(|| ProviderError::Malformed {
                provider: "OpenAI".to_string(),
                message: "response contained no choices".to_string(),
            })?;

        serde_json::from_str(&content).map_err(|e| ProviderError::Malformed {
            provider: "OpenAI".to_string(),
            message: format!("response was not the requested JSON: {}", e),
        })
    }
}

// API types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    temperature: f32,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    description: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChatMessage>,
}

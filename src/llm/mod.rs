//! Language-intelligence collaborator.
//!
//! Everything upstream talks to a [`LanguageService`]: one prompt in, free
//! text out. Structured replies go through [`structured::generate_json`],
//! which ships a JSON Schema with the prompt and validates what comes back.
//! [`LlmPool`] is the production implementation over the Anthropic API.

pub mod client;
pub mod structured;
pub mod types;

use async_trait::async_trait;
use tracing::debug;

use client::AnthropicClient;
use types::{resolve_model, Message, MessagesRequest};

/// Errors from LLM operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("missing API key: {0}")]
    MissingApiKey(String),

    #[error("unparsable structured response: {0}")]
    Parse(String),

    #[error("response violates schema: {0}")]
    Schema(String),
}

/// One generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Short name of the calling stage; used for logs and by test fakes.
    pub label: String,
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    /// JSON Schema the reply must satisfy.
    pub schema: Option<serde_json::Value>,
}

impl GenerateRequest {
    pub fn new(label: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            prompt: prompt.into(),
            system: None,
            temperature: None,
            schema: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

#[async_trait]
pub trait LanguageService: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<String, LlmError>;
}

/// Anthropic-backed language service with model alias resolution.
#[derive(Debug)]
pub struct LlmPool {
    client: AnthropicClient,
    model: String,
    max_tokens: u32,
}

impl LlmPool {
    pub fn new(api_key: String, model: &str, max_tokens: u32) -> Self {
        Self::with_client(AnthropicClient::new(api_key), model, max_tokens)
    }

    /// Reads `ANTHROPIC_API_KEY`.
    pub fn from_env(model: &str, max_tokens: u32, base_url: Option<&str>) -> Result<Self, LlmError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            LlmError::MissingApiKey("ANTHROPIC_API_KEY environment variable not set".into())
        })?;
        let client = match base_url {
            Some(url) => AnthropicClient::with_base_url(api_key, url.into()),
            None => AnthropicClient::new(api_key),
        };
        Ok(Self::with_client(client, model, max_tokens))
    }

    pub fn with_client(client: AnthropicClient, model: &str, max_tokens: u32) -> Self {
        Self {
            client,
            model: resolve_model(model).to_string(),
            max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// System prompt for a request: the caller's own plus schema instructions.
fn system_prompt(request: &GenerateRequest) -> Option<String> {
    let schema_note = request.schema.as_ref().map(|schema| {
        format!(
            "Respond with a single JSON document and nothing else. \
             It must validate against this JSON Schema:\n{schema}"
        )
    });
    match (request.system.as_deref(), schema_note) {
        (Some(sys), Some(note)) => Some(format!("{sys}\n\n{note}")),
        (Some(sys), None) => Some(sys.to_string()),
        (None, note) => note,
    }
}

#[async_trait]
impl LanguageService for LlmPool {
    async fn generate(&self, request: GenerateRequest) -> Result<String, LlmError> {
        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![Message::user(request.prompt.clone())],
            system: system_prompt(&request),
            temperature: request.temperature,
        };

        let response = self.client.messages(&body).await?;
        debug!(
            label = %request.label,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "generation finished"
        );

        let text = response.text();
        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse("empty completion".into()));
        }
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_resolves_alias() {
        let pool = LlmPool::new("test-key".into(), "sonnet", 4000);
        assert_eq!(pool.model(), "claude-sonnet-4-5-20250514");
    }

    #[test]
    fn system_prompt_merges_schema_note() {
        let req = GenerateRequest::new("judge", "pick one")
            .with_system("You are a reviewer.")
            .with_schema(serde_json::json!({"type": "object"}));
        let sys = system_prompt(&req).unwrap();
        assert!(sys.starts_with("You are a reviewer."));
        assert!(sys.contains("JSON Schema"));
        assert!(sys.contains("\"type\":\"object\""));

        let plain = GenerateRequest::new("describe", "text");
        assert!(system_prompt(&plain).is_none());
    }

    #[test]
    fn error_display() {
        let err = LlmError::ApiError {
            status: 401,
            message: "invalid api key".into(),
        };
        assert!(err.to_string().contains("401"));

        let err = LlmError::Schema("missing field".into());
        assert!(err.to_string().contains("violates schema"));
    }
}

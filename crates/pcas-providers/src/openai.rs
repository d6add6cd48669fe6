//! OpenAI-backed compute and embedding providers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedding::Embedder;
use crate::error::{ProviderError, Result};
use crate::provider::{ComputeProvider, RequestData};

fn classify_status(status: reqwest::StatusCode, body: String) -> ProviderError {
    let detail = format!("status {status}: {body}");
    match status.as_u16() {
        401 | 403 => ProviderError::Unauthorized(detail),
        429 => ProviderError::RateLimited(detail),
        500 | 502 | 503 => ProviderError::Unavailable(detail),
        _ => ProviderError::Internal(detail),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the OpenAI chat provider.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Model to use for completions.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Request timeout.
    pub timeout: Duration,
}

impl OpenAiConfig {
    /// Create a config with the given API key and defaults.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            timeout: Duration::from_secs(60),
        }
    }

    /// Create a config from the `OPENAI_API_KEY` environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            ProviderError::Unauthorized("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self::new(api_key))
    }

    /// Override the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Chat-completion compute provider.
///
/// Accepts either a RAG-enriched `messages` list or a bare `prompt` field in
/// the request payload.
pub struct OpenAiProvider {
    name: String,
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    /// Create a provider with the given configuration.
    pub fn new(name: impl Into<String>, config: OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            client,
            config,
        })
    }

    fn build_messages(&self, request: Option<&RequestData>) -> Result<Vec<ChatMessage>> {
        let request = request.ok_or_else(|| {
            ProviderError::InvalidInput("no 'prompt' or 'messages' field in request".to_string())
        })?;

        if let Some(messages) = request.get("messages").and_then(|v| v.as_array()) {
            let mut out = Vec::with_capacity(messages.len());
            for entry in messages {
                let obj = entry.as_object().ok_or_else(|| {
                    ProviderError::InvalidInput("'messages' entries must be objects".to_string())
                })?;
                let role = match obj.get("role").and_then(|v| v.as_str()) {
                    Some("system") => "system",
                    Some("assistant") => "assistant",
                    _ => "user",
                };
                let content = obj
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                out.push(ChatMessage {
                    role: role.to_string(),
                    content: content.to_string(),
                });
            }
            debug!(provider = %self.name, count = out.len(), "Using pre-built message list");
            return Ok(out);
        }

        let prompt = request
            .get("prompt")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidInput(
                    "no 'prompt' or 'messages' field in request".to_string(),
                )
            })?;

        Ok(vec![ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }])
    }
}

#[async_trait]
impl ComputeProvider for OpenAiProvider {
    async fn execute(&self, request: Option<&RequestData>) -> Result<String> {
        let messages = self.build_messages(request)?;

        let body = ChatRequest {
            model: self.config.model.clone(),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("failed to decode response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Internal("no response choices returned".to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the OpenAI embedding backend.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedderConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Embedding model.
    pub model: String,
    /// Request timeout.
    pub timeout: Duration,
}

impl OpenAiEmbedderConfig {
    /// Create a config with the given API key and defaults.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Create a config from the `OPENAI_API_KEY` environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            ProviderError::Unauthorized("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self::new(api_key))
    }

    /// Override the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI embeddings API client.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    config: OpenAiEmbedderConfig,
    dimensions: usize,
}

impl OpenAiEmbedder {
    /// Create an embedder with the given configuration.
    pub fn new(config: OpenAiEmbedderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Internal(format!("failed to create HTTP client: {e}")))?;

        let dimensions = match config.model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        };

        Ok(Self {
            client,
            config,
            dimensions,
        })
    }

    /// Create from environment configuration.
    pub fn from_env() -> Result<Self> {
        Self::new(OpenAiEmbedderConfig::from_env()?)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            model: self.config.model.clone(),
            input: vec![text.to_string()],
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("failed to decode response: {e}")))?;

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        data.into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::Internal("no embedding returned".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "openai"
    }
}

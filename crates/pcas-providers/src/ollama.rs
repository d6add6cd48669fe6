//! Local inference provider backed by an Ollama server.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ProviderError, Result};
use crate::provider::{ComputeProvider, RequestData};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    done: bool,
}

/// Compute provider talking to a local Ollama instance.
///
/// Transport-layer failures are retried with a small fixed budget and linear
/// backoff; invalid input and authentication failures are never retried.
pub struct OllamaProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
}

impl OllamaProvider {
    /// Create a provider for the given base URL (e.g. `http://localhost:11434`).
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.into(),
        })
    }

    fn extract_parameters<'a>(&self, request: Option<&'a RequestData>) -> Result<(&'a str, &'a str)> {
        let request = request
            .ok_or_else(|| ProviderError::InvalidInput("missing request data".to_string()))?;

        let model = request
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidInput("model must be a non-empty string".to_string())
            })?;

        if request.get("stream").and_then(|v| v.as_bool()) == Some(true) {
            return Err(ProviderError::InvalidInput(
                "streaming responses are not supported on the unary path".to_string(),
            ));
        }

        let prompt = request
            .get("prompt")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidInput("prompt must be a non-empty string".to_string())
            })?;

        Ok((model, prompt))
    }

    async fn do_request(&self, model: &str, prompt: &str) -> Result<String> {
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = format!("status {status}: {text}");
            return Err(match status.as_u16() {
                401 => ProviderError::Unauthorized(detail),
                429 => ProviderError::RateLimited(detail),
                500 | 502 | 503 => ProviderError::Unavailable(detail),
                _ => ProviderError::Internal(detail),
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("failed to decode response: {e}")))?;

        if !parsed.done {
            return Err(ProviderError::Internal(
                "incomplete response from Ollama".to_string(),
            ));
        }

        Ok(parsed.response)
    }
}

#[async_trait]
impl ComputeProvider for OllamaProvider {
    async fn execute(&self, request: Option<&RequestData>) -> Result<String> {
        let (model, prompt) = self.extract_parameters(request)?;
        debug!(provider = %self.name, model, "Ollama execution starting");

        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                warn!(
                    provider = %self.name,
                    attempt,
                    delay_ms = RETRY_DELAY.as_millis() as u64,
                    "Retrying Ollama request"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }

            match self.do_request(model, prompt).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let retryable = err.is_retryable();
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ProviderError::Internal("no attempt was made".to_string())))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

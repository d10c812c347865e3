//! Provider adapters — uniform transport over heterogeneous model APIs.
//!
//! Adapters are pure transport plus token accounting: they never interpret
//! the text and never retry (retry policy belongs to the agent runner).
//! All four default providers are reached through OpenAI-compatible
//! chat-completions gateways, so one HTTP adapter parameterized by
//! endpoint covers them.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

/// A single completion request.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Effective deadline for this call.
    pub deadline: Duration,
}

/// A completion response with token accounting.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// Model that actually served the request.
    pub model_id: String,
}

/// Typed transport errors. `is_transient` drives the runner's retry policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited")]
    RateLimited,

    #[error("call exceeded deadline after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether the runner may retry after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited | Self::Timeout { .. } | Self::Network(_) => true,
            Self::Upstream { status, .. } => *status >= 500,
            Self::InvalidRequest(_) => false,
        }
    }
}

/// Uniform call interface over a model provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Perform one completion call within the request's deadline.
    async fn invoke(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Whether the provider endpoint currently answers at all.
    async fn reachable(&self) -> bool;

    /// Endpoint identity for logging and per-provider concurrency caps.
    fn endpoint_name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
}

/// Rough token estimate when the gateway omits a usage block.
fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() / 4).max(1) as u32
}

/// HTTP adapter for an OpenAI-compatible chat-completions endpoint.
pub struct HttpAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    name: String,
}

impl HttpAdapter {
    pub fn new(name: &str, base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            name: name.to_string(),
        }
    }

    fn classify_send_error(&self, started: Instant, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    async fn invoke(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_prompt},
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(request.deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify_send_error(started, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited,
                code @ 400..=499 => {
                    ProviderError::InvalidRequest(format!("{code}: {message}"))
                }
                code => ProviderError::Upstream {
                    status: code,
                    message,
                },
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Network(format!("malformed response body: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let (tokens_in, tokens_out) = match parsed.usage {
            Some(usage) => (
                usage
                    .prompt_tokens
                    .unwrap_or_else(|| estimate_tokens(&request.user_prompt)),
                usage
                    .completion_tokens
                    .unwrap_or_else(|| estimate_tokens(&text)),
            ),
            None => {
                warn!(
                    endpoint = %self.name,
                    model = %request.model,
                    "no usage block in response, estimating tokens"
                );
                (
                    estimate_tokens(&request.user_prompt) + estimate_tokens(&request.system_prompt),
                    estimate_tokens(&text),
                )
            }
        };

        Ok(ProviderResponse {
            text,
            tokens_in,
            tokens_out,
            model_id: parsed.model.unwrap_or(request.model),
        })
    }

    async fn reachable(&self) -> bool {
        let models_url = format!("{}/models", self.base_url);
        let mut req = self
            .client
            .get(&models_url)
            .timeout(Duration::from_secs(5));
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(
                    endpoint = %self.name,
                    status = %resp.status(),
                    "endpoint returned non-success status"
                );
                false
            }
            Err(e) => {
                warn!(endpoint = %self.name, error = %e, "endpoint unreachable");
                false
            }
        }
    }

    fn endpoint_name(&self) -> &str {
        &self.name
    }
}

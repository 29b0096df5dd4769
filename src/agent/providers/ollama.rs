//! Ollama backend over its HTTP API.
//!
//! Endpoint: `POST {base_url}/api/generate` with `stream: false`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::agent::message::{ChatRequest, ChatResponse, TokenUsage};
use crate::agent::provider::CompletionBackend;
use crate::error::ProviderError;

/// Default Ollama API endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ollama completion backend.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
}

impl OllamaBackend {
    /// Creates a backend talking to `base_url` (defaults to the local daemon).
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Permanent`] if the HTTP client cannot be built.
    pub fn new(base_url: Option<&str>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Permanent {
                message: format!("failed to build HTTP client: {e}"),
                status: None,
            })?;

        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or(DEFAULT_OLLAMA_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(request: &ChatRequest) -> GenerateRequest {
        GenerateRequest {
            model: request.model.clone(),
            prompt: request.prompt(),
            system: request.system().map(str::to_string),
            stream: false,
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        }
    }
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/api/generate", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&Self::build_request(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ProviderError::Transient {
                        message: format!("failed to reach Ollama at {url}: {e}"),
                        status: None,
                    }
                } else {
                    ProviderError::Permanent {
                        message: e.to_string(),
                        status: None,
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| ProviderError::Transient {
            message: format!("unreadable Ollama response: {e}"),
            status: None,
        })?;

        let prompt_tokens = body.prompt_eval_count.unwrap_or(0);
        let completion_tokens = body.eval_count.unwrap_or(0);
        Ok(ChatResponse {
            content: body.response,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens.saturating_add(completion_tokens),
            },
            finish_reason: body.done_reason,
        })
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

//! `OpenAI` backend implementation using the `async-openai` crate.
//!
//! Supports any `OpenAI`-compatible API (`OpenAI`, Azure, local proxies)
//! via the base URL override in [`ProviderConfig`](crate::core::ProviderConfig).

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
};
use async_trait::async_trait;

use crate::agent::message::{ChatMessage, ChatRequest, ChatResponse, Role, TokenUsage};
use crate::agent::provider::CompletionBackend;
use crate::error::ProviderError;

/// `OpenAI`-compatible completion backend.
///
/// Wraps the `async-openai` client for chat completions.
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
}

impl OpenAiBackend {
    /// Creates a backend for `api_key`, optionally against another base URL.
    #[must_use]
    pub fn new(api_key: &str, base_url: Option<&str>) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);

        if let Some(base_url) = base_url {
            openai_config = openai_config.with_api_base(base_url);
        }

        Self {
            client: Client::with_config(openai_config),
        }
    }

    /// Converts our message type to the `OpenAI` SDK type.
    fn convert_message(msg: &ChatMessage) -> ChatCompletionRequestMessage {
        match msg.role {
            Role::System => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(msg.content.clone()),
                    name: None,
                })
            }
            Role::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(msg.content.clone()),
                name: None,
            }),
            Role::Assistant => {
                #[allow(deprecated)]
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content: Some(ChatCompletionRequestAssistantMessageContent::Text(
                        msg.content.clone(),
                    )),
                    name: None,
                    tool_calls: None,
                    refusal: None,
                    audio: None,
                    function_call: None,
                })
            }
        }
    }

    /// Builds an `OpenAI` chat completion request from our generic request.
    fn build_request(request: &ChatRequest) -> CreateChatCompletionRequest {
        CreateChatCompletionRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            temperature: request.temperature,
            max_completion_tokens: request.max_tokens,
            ..Default::default()
        }
    }

    /// Maps an SDK error onto the transient/permanent split.
    fn classify_error(err: OpenAIError) -> ProviderError {
        match err {
            OpenAIError::Reqwest(e) => {
                if let Some(status) = e.status() {
                    ProviderError::from_status(status.as_u16(), e.to_string())
                } else if e.is_timeout() || e.is_connect() || e.is_request() {
                    ProviderError::Transient {
                        message: e.to_string(),
                        status: None,
                    }
                } else {
                    ProviderError::Permanent {
                        message: e.to_string(),
                        status: None,
                    }
                }
            }
            OpenAIError::ApiError(api) => {
                let detail = format!("{api:?}").to_ascii_lowercase();
                let message = api.message;
                if detail.contains("rate_limit")
                    || detail.contains("server_error")
                    || detail.contains("overloaded")
                {
                    ProviderError::Transient {
                        message,
                        status: None,
                    }
                } else {
                    ProviderError::Permanent {
                        message,
                        status: None,
                    }
                }
            }
            OpenAIError::StreamError(message) => ProviderError::Transient {
                message,
                status: None,
            },
            other => ProviderError::Permanent {
                message: other.to_string(),
                status: None,
            },
        }
    }
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("client", &"<async-openai::Client>")
            .finish()
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let openai_request = Self::build_request(request);

        let response = self
            .client
            .chat()
            .create(openai_request)
            .await
            .map_err(Self::classify_error)?;

        let choice = response.choices.first();

        let content = choice
            .and_then(|c| c.message.content.as_ref())
            .cloned()
            .unwrap_or_default();

        let finish_reason = choice.and_then(|c| {
            c.finish_reason
                .as_ref()
                .map(|fr| format!("{fr:?}").to_lowercase())
        });

        let usage = response
            .usage
            .map_or_else(TokenUsage::default, |u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            });

        Ok(ChatResponse {
            content,
            usage,
            finish_reason,
        })
    }
}

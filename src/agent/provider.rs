//! Pluggable completion backend trait.
//!
//! Implementations translate provider-agnostic [`ChatRequest`]/[`ChatResponse`]
//! into provider-specific calls and classify their failures as transient or
//! permanent. Retry, timeout and concurrency limits live in
//! [`GenerationClient`](super::generation::GenerationClient), not here.

use async_trait::async_trait;

use super::message::{ChatRequest, ChatResponse};
use crate::error::ProviderError;

/// Trait for LLM completion backends.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Backend name (e.g., `"openai"`, `"ollama"`).
    fn name(&self) -> &'static str;

    /// Executes one completion request.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transient`] for timeouts, rate limits, 5xx
    /// and connection failures, [`ProviderError::Permanent`] otherwise.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

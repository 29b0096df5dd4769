//! Generation client: prompt assembly, backend dispatch, and call limits.
//!
//! Every attempt holds one permit of a process-wide semaphore for the length
//! of the backend call, so the number of in-flight generations never exceeds
//! `max_inflight_generations` whatever the worker pool size. Backoff sleeps
//! happen without a permit. A cancelled pass stops before the next attempt,
//! including one still waiting for a permit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::BackendRegistry;
use super::message::{ChatRequest, TokenUsage, system_message, user_message};
use super::prompt::{PromptSet, build_section_prompt};
use super::retry::{RetryOutcome, RetryPolicy};
use crate::core::{ProviderConfig, RetrievalResult, SectionKind};
use crate::error::ProviderError;

/// What a section asks the model for.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    /// Section kind; selects the system prompt.
    pub kind: SectionKind,
    /// Requirement or question text.
    pub requirement_text: &'a str,
    /// Retrieved evidence.
    pub passages: &'a [RetrievalResult],
}

/// A successful generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    /// Completion text, trimmed.
    pub text: String,
    /// Token usage of the successful attempt.
    pub usage: TokenUsage,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Provider-agnostic generation with retry, timeout and a global
/// concurrency ceiling.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    registry: Arc<BackendRegistry>,
    prompts: Arc<PromptSet>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl GenerationClient {
    /// Creates a client allowing `max_inflight` concurrent backend calls.
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        prompts: Arc<PromptSet>,
        policy: RetryPolicy,
        max_inflight: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            prompts,
            policy,
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
            timeout,
        }
    }

    /// Builds the backend request for `context`.
    #[must_use]
    pub fn build_request(&self, context: &PromptContext<'_>, provider: &ProviderConfig) -> ChatRequest {
        ChatRequest {
            model: provider.model_for(context.kind).to_string(),
            messages: vec![
                system_message(self.prompts.system_for(context.kind)),
                user_message(&build_section_prompt(context.requirement_text, context.passages)),
            ],
            temperature: Some(provider.temperature),
            max_tokens: Some(provider.max_output_tokens),
        }
    }

    /// Generates text for one section with the given provider.
    ///
    /// # Errors
    ///
    /// - [`ProviderError::Permanent`] (and registry errors) immediately
    /// - [`ProviderError::Unavailable`] once transient failures exhaust the retry policy
    /// - [`ProviderError::Cancelled`] if `cancel` fires before an attempt succeeds
    pub async fn generate(
        &self,
        context: &PromptContext<'_>,
        provider: &ProviderConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<Generated, ProviderError> {
        let backend = self.registry.resolve(provider)?;
        let request = self.build_request(context, provider);
        let timeout = self.timeout;

        let (response, attempts) = self
            .policy
            .execute("generate", cancel, |attempt| {
                let backend = Arc::clone(&backend);
                let permits = Arc::clone(&self.permits);
                let request = &request;
                async move {
                    let _permit = permits.acquire_owned().await.map_err(|_| ProviderError::Permanent {
                        message: "generation limiter closed".to_string(),
                        status: None,
                    })?;
                    if cancel.is_some_and(CancellationToken::is_cancelled) {
                        return Err(ProviderError::Cancelled);
                    }
                    debug!(backend = backend.name(), model = %request.model, attempt, "generation call");
                    let response = tokio::time::timeout(timeout, backend.complete(request))
                        .await
                        .unwrap_or_else(|_| {
                            Err(ProviderError::Transient {
                                message: format!("request timed out after {timeout:?}"),
                                status: None,
                            })
                        })?;
                    if response.content.trim().is_empty() {
                        return Err(ProviderError::Transient {
                            message: "backend returned an empty completion".to_string(),
                            status: None,
                        });
                    }
                    Ok::<_, ProviderError>((response, attempt))
                }
            })
            .await
            .map_err(|outcome| match outcome {
                RetryOutcome::Permanent(err) => err,
                RetryOutcome::Exhausted { attempts, last } => ProviderError::Unavailable {
                    attempts,
                    last: last.to_string(),
                },
                RetryOutcome::Cancelled { .. } => ProviderError::Cancelled,
            })?;

        info!(
            backend = backend.name(),
            model = %request.model,
            attempts,
            completion_tokens = response.usage.completion_tokens,
            "generation complete"
        );
        Ok(Generated {
            text: response.content.trim().to_string(),
            usage: response.usage,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::message::ChatResponse;
    use crate::agent::provider::CompletionBackend;
    use crate::core::ProviderKind;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted results, then succeeds with `"YES\nok"`.
    struct Scripted {
        script: Mutex<Vec<Result<String, ProviderError>>>,
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let next = {
                let mut script = self.script.lock().unwrap_or_else(|_| unreachable!());
                if script.is_empty() { Ok("YES\nok".to_string()) } else { script.remove(0) }
            };
            next.map(|content| ChatResponse {
                content,
                usage: TokenUsage::default(),
                finish_reason: Some("stop".to_string()),
            })
        }
    }

    fn client(backend: Arc<Scripted>, max_inflight: usize) -> GenerationClient {
        let registry = BackendRegistry::new(None).with_backend(ProviderKind::Local, backend);
        GenerationClient::new(
            Arc::new(registry),
            Arc::new(PromptSet::defaults()),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)).without_jitter(),
            max_inflight,
            Duration::from_secs(5),
        )
    }

    fn context() -> PromptContext<'static> {
        PromptContext {
            kind: SectionKind::Compliance,
            requirement_text: "Supports SSO",
            passages: &[],
        }
    }

    fn transient() -> ProviderError {
        ProviderError::Transient {
            message: "503".to_string(),
            status: Some(503),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_and_empty() {
        let backend = Arc::new(Scripted::new(vec![Err(transient()), Ok("   ".to_string())]));
        let client = client(Arc::clone(&backend), 2);
        let out = client
            .generate(&context(), &ProviderConfig::new(ProviderKind::Local), None)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(out.text, "YES\nok");
        assert_eq!(out.attempts, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_unavailable() {
        let backend = Arc::new(Scripted::new(vec![Err(transient()), Err(transient()), Err(transient())]));
        let client = client(Arc::clone(&backend), 2);
        let err = client
            .generate(&context(), &ProviderConfig::new(ProviderKind::Local), None)
            .await;
        assert!(matches!(err, Err(ProviderError::Unavailable { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let backend = Arc::new(Scripted::new(vec![Err(ProviderError::Permanent {
            message: "content policy".to_string(),
            status: Some(400),
        })]));
        let client = client(Arc::clone(&backend), 2);
        let err = client
            .generate(&context(), &ProviderConfig::new(ProviderKind::Local), None)
            .await;
        assert!(matches!(err, Err(ProviderError::Permanent { .. })));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_cloud_needs_key() {
        let client = client(Arc::new(Scripted::new(Vec::new())), 1);
        let err = client
            .generate(&context(), &ProviderConfig::new(ProviderKind::Cloud), None)
            .await;
        assert!(matches!(err, Err(ProviderError::ApiKeyMissing)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_inflight_ceiling() {
        let mut scripted = Scripted::new(Vec::new());
        scripted.delay = Duration::from_millis(20);
        let backend = Arc::new(scripted);
        let client = client(Arc::clone(&backend), 2);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client
                    .generate(&context(), &ProviderConfig::new(ProviderKind::Local), None)
                    .await
                    .is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap_or_default());
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 8);
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_request_uses_provider_params() {
        let client = client(Arc::new(Scripted::new(Vec::new())), 1);
        let provider = ProviderConfig::new(ProviderKind::Local).with_model("mistral");
        let request = client.build_request(&context(), &provider);
        assert_eq!(request.model, "mistral");
        assert_eq!(request.max_tokens, Some(900));
        assert!(request.system().is_some_and(|s| s.contains("compliance")));
        assert!(request.prompt().contains("Supports SSO"));
    }

    #[test]
    fn test_compliance_model_override() {
        let client = client(Arc::new(Scripted::new(Vec::new())), 1);
        let provider = ProviderConfig::new(ProviderKind::Local)
            .with_model("llama3")
            .with_compliance_model("phi3:mini");
        assert_eq!(client.build_request(&context(), &provider).model, "phi3:mini");
        let narrative = PromptContext {
            kind: SectionKind::Narrative,
            ..context()
        };
        assert_eq!(client.build_request(&narrative, &provider).model, "llama3");
    }

    #[tokio::test]
    async fn test_cancel_stops_retries() {
        let backend = Arc::new(Scripted::new(vec![Err(transient()), Err(transient()), Err(transient())]));
        let client = client(Arc::clone(&backend), 1);
        let cancel = CancellationToken::new();

        // Hold the only permit so the first attempt waits, then cancel.
        let held = Arc::clone(&client.permits).acquire_owned().await.unwrap_or_else(|_| unreachable!());
        let task = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .generate(&context(), &ProviderConfig::new(ProviderKind::Local), Some(&cancel))
                    .await
            })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        drop(held);

        let err = task.await.unwrap_or_else(|_| unreachable!());
        assert!(matches!(err, Err(ProviderError::Cancelled)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}

//! Shared doubles for integration tests: a scripted completion backend, a
//! fixed-candidate vector store and a constant embedder.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use rfp_agent::agent::{
    BackendRegistry, ChatRequest, ChatResponse, CompletionBackend, GenerationClient, Orchestrator,
    OrchestratorSettings, PromptSet, RetryPolicy, TokenUsage,
};
use rfp_agent::checkpoint::{CheckpointRecord, CheckpointStore, MemoryCheckpointStore};
use rfp_agent::core::{ProviderConfig, ProviderKind, RunHeader, SectionDef, SectionKind, SectionState};
use rfp_agent::error::{CheckpointError, ProviderError, RetrievalError};
use rfp_agent::retrieval::embedding::Embedder;
use rfp_agent::retrieval::store::{Candidate, ChunkRecord, VectorStore};
use rfp_agent::retrieval::{RetrievalClient, RetrievalSettings};

type Reply = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Completion backend whose answers are derived from the prompt text.
///
/// Prompts containing a marker registered with [`fail_on`](Self::fail_on)
/// fail permanently; those matching [`busy_on`](Self::busy_on) fail with a
/// retryable 503.
pub struct ScriptedBackend {
    name: &'static str,
    reply: Reply,
    failing: Mutex<HashSet<String>>,
    busy: Mutex<HashSet<String>>,
    cancel_on_call: Mutex<Option<CancellationToken>>,
    max_delay_ms: u64,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    models: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(reply: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            name: "scripted",
            reply: Box::new(reply),
            failing: Mutex::new(HashSet::new()),
            busy: Mutex::new(HashSet::new()),
            cancel_on_call: Mutex::new(None),
            max_delay_ms: 0,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            models: Mutex::new(Vec::new()),
        }
    }

    /// Always answers `text`.
    pub fn constant(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_| text.clone())
    }

    /// Sleeps a random 0..=`ms` milliseconds before answering.
    pub fn with_random_delay(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub fn fail_on(&self, marker: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(marker.to_string());
        }
    }

    pub fn busy_on(&self, marker: &str) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.insert(marker.to_string());
        }
    }

    /// Cancels `token` from inside the next call, as an operator interrupt
    /// arriving while a request is in flight.
    pub fn cancel_on_call(&self, token: CancellationToken) {
        if let Ok(mut slot) = self.cancel_on_call.lock() {
            *slot = Some(token);
        }
    }

    pub fn heal(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
        if let Ok(mut busy) = self.busy.lock() {
            busy.clear();
        }
        if let Ok(mut slot) = self.cancel_on_call.lock() {
            *slot = None;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// `(model, prompt)` of every call, in call order.
    pub fn requests(&self) -> Vec<(String, String)> {
        let models = self.models.lock().map(|m| m.clone()).unwrap_or_default();
        models.into_iter().zip(self.prompts()).collect()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request.prompt();
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        if let Ok(mut models) = self.models.lock() {
            models.push(request.model.clone());
        }
        if let Some(token) = self.cancel_on_call.lock().ok().and_then(|slot| slot.clone()) {
            token.cancel();
        }

        if self.max_delay_ms > 0 {
            let ms = rand::thread_rng().gen_range(0..=self.max_delay_ms);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let failing = self
            .failing
            .lock()
            .map(|f| f.iter().any(|m| prompt.contains(m.as_str())))
            .unwrap_or(false);
        if failing {
            return Err(ProviderError::Permanent {
                message: "content policy rejection".to_string(),
                status: Some(400),
            });
        }
        let busy = self
            .busy
            .lock()
            .map(|b| b.iter().any(|m| prompt.contains(m.as_str())))
            .unwrap_or(false);
        if busy {
            return Err(ProviderError::from_status(503, "model is loading"));
        }

        Ok(ChatResponse {
            content: (self.reply)(&prompt),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: Some("stop".to_string()),
        })
    }
}

/// Vector store that returns the same candidates for every query.
pub struct FixedStore {
    candidates: Vec<Candidate>,
    queries: AtomicUsize,
}

impl FixedStore {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            queries: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// One high-scoring passage from `kb.md`.
    pub fn single() -> Self {
        Self::new(vec![candidate("kb.md#0", "SAML 2.0 single sign-on is supported.", 0.9)])
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorStore for FixedStore {
    async fn upsert(&self, _chunk: ChunkRecord) -> Result<(), RetrievalError> {
        Ok(())
    }

    async fn query(
        &self,
        _embedding: &[f32],
        k: usize,
        _filter: Option<&[String]>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.candidates.iter().take(k).cloned().collect())
    }
}

/// Checkpoint store whose appends block the calling thread for `delay`.
pub struct SlowStore {
    inner: MemoryCheckpointStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            delay,
        }
    }
}

impl CheckpointStore for SlowStore {
    fn create_run(&self, header: &RunHeader) -> Result<(), CheckpointError> {
        self.inner.create_run(header)
    }

    fn append(&self, run_id: &str, section_id: &str, state: &SectionState) -> Result<i64, CheckpointError> {
        std::thread::sleep(self.delay);
        self.inner.append(run_id, section_id, state)
    }

    fn load_header(&self, run_id: &str) -> Result<RunHeader, CheckpointError> {
        self.inner.load_header(run_id)
    }

    fn list_runs(&self) -> Result<Vec<RunHeader>, CheckpointError> {
        self.inner.list_runs()
    }

    fn records(&self, run_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        self.inner.records(run_id)
    }

    fn update_provider(&self, run_id: &str, provider: &ProviderConfig) -> Result<(), CheckpointError> {
        self.inner.update_provider(run_id, provider)
    }

    fn mark_completed(&self, run_id: &str, at: DateTime<Utc>) -> Result<(), CheckpointError> {
        self.inner.mark_completed(run_id, at)
    }

    fn mark_reopened(&self, run_id: &str) -> Result<(), CheckpointError> {
        self.inner.mark_reopened(run_id)
    }

    fn mark_abandoned(&self, run_id: &str, at: DateTime<Utc>) -> Result<(), CheckpointError> {
        self.inner.mark_abandoned(run_id, at)
    }
}

pub fn candidate(chunk_id: &str, text: &str, score: f32) -> Candidate {
    Candidate {
        chunk_id: chunk_id.to_string(),
        source_document_id: chunk_id.split('#').next().unwrap_or_default().to_string(),
        passage_text: text.to_string(),
        token_count: text.split_whitespace().count(),
        score,
    }
}

/// Embeds everything to the same unit vector.
pub struct ConstantEmbedder;

impl Embedder for ConstantEmbedder {
    fn model_name(&self) -> &str {
        "constant"
    }

    fn dimensions(&self) -> usize {
        4
    }

    fn embed(&self, _text: &str) -> Result<Vec<f32>, RetrievalError> {
        Ok(vec![0.5; 4])
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)).without_jitter()
}

/// Builds an orchestrator whose local backend is `local` and (optionally)
/// whose cloud backend is `cloud`.
pub fn orchestrator(
    store: Arc<dyn CheckpointStore>,
    kb: Arc<FixedStore>,
    local: Arc<ScriptedBackend>,
    cloud: Option<Arc<ScriptedBackend>>,
    settings: OrchestratorSettings,
) -> Orchestrator {
    let retrieval = RetrievalClient::new(
        kb,
        Arc::new(ConstantEmbedder),
        fast_policy(),
        RetrievalSettings {
            min_similarity: 0.0,
            ..RetrievalSettings::default()
        },
    );

    let mut registry = BackendRegistry::new(None).with_backend(ProviderKind::Local, local);
    if let Some(cloud) = cloud {
        registry = registry.with_backend(ProviderKind::Cloud, cloud);
    }
    let generation = GenerationClient::new(
        Arc::new(registry),
        Arc::new(PromptSet::defaults()),
        fast_policy(),
        8,
        Duration::from_secs(5),
    );
    Orchestrator::new(retrieval, generation, store, settings)
}

pub fn settings(concurrency: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        concurrency,
        ..OrchestratorSettings::default()
    }
}

/// `n` sections of `kind` with requirement text `requirement <id>`.
pub fn sections(n: usize, kind: SectionKind) -> Vec<SectionDef> {
    (0..n)
        .map(|i| {
            let id = format!("s{i:04}");
            let text = format!("requirement {id}");
            SectionDef::new(id, i, kind, text)
        })
        .collect()
}

//! Application configuration with builder pattern, file and environment support.
//!
//! Configuration is resolved in order: explicit values (CLI flags) →
//! environment variables → config file → defaults. The config file is TOML
//! and unknown keys are rejected at load time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::retry::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_MAX_RETRIES, RetryPolicy,
};
use crate::core::{ProviderConfig, ProviderKind, RetrievalProfile};
use crate::error::ConfigError;
use crate::retrieval::TieBreak;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "rfp-agent.toml";

/// Default retrieval passage cap per section.
const DEFAULT_TOP_K: usize = 3;
/// Default retrieval token budget per section.
const DEFAULT_MAX_CONTEXT_TOKENS: usize = 2000;
/// Default passage cap for compliance sections.
const DEFAULT_COMPLIANCE_TOP_K: usize = 1;
/// Default token budget for compliance sections.
const DEFAULT_COMPLIANCE_MAX_CONTEXT_TOKENS: usize = 800;
/// Default worker pool size.
const DEFAULT_CONCURRENCY: usize = 4;
/// Default per-section attempt ceiling.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default global ceiling on in-flight generation calls.
const DEFAULT_MAX_INFLIGHT_GENERATIONS: usize = 2;
/// Default similarity threshold.
const DEFAULT_MIN_SIMILARITY: f32 = 0.3;
/// Default candidates requested from the store.
const DEFAULT_CANDIDATE_POOL: usize = 20;
/// Default generation call timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
/// Default store call timeout in seconds.
const DEFAULT_RETRIEVAL_TIMEOUT_SECS: u64 = 30;
/// Default sampling temperature.
const DEFAULT_TEMPERATURE: f32 = 0.3;
/// Default completion length cap.
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 900;
/// Default checkpoint database.
const DEFAULT_CHECKPOINT_PATH: &str = ".rfp/checkpoints.db";
/// Default knowledge-base database.
const DEFAULT_KNOWLEDGE_BASE_PATH: &str = ".rfp/knowledge.db";

/// Resolved application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Generation backend.
    pub provider: ProviderKind,
    /// Model identifier.
    pub model_name: String,
    /// Model for compliance sections; `model_name` when unset.
    pub compliance_model_name: Option<String>,
    /// API key for the cloud backend (environment only).
    pub api_key: Option<String>,
    /// API base URL override.
    pub base_url: Option<String>,
    /// Retrieval passage cap per narrative section.
    pub top_k: usize,
    /// Retrieval token budget per narrative section.
    pub max_context_tokens: usize,
    /// Retrieval passage cap per compliance section.
    pub compliance_top_k: usize,
    /// Retrieval token budget per compliance section.
    pub compliance_max_context_tokens: usize,
    /// Transient retry ceiling per call.
    pub max_retries: u32,
    /// Checkpoint database path.
    pub checkpoint_path: PathBuf,
    /// Worker pool size.
    pub concurrency: usize,
    /// Per-section attempt ceiling for retry resets.
    pub max_attempts: u32,
    /// Global ceiling on in-flight generation calls.
    pub max_inflight_generations: usize,
    /// Minimum similarity for a passage to be attached.
    pub min_similarity: f32,
    /// Candidates requested from the vector store.
    pub candidate_pool: usize,
    /// Equal-score ordering.
    pub tie_break: TieBreak,
    /// Generation call timeout.
    pub request_timeout: Duration,
    /// Store call timeout.
    pub retrieval_timeout: Duration,
    /// First backoff delay.
    pub backoff_base: Duration,
    /// Backoff cap.
    pub backoff_max: Duration,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion length cap.
    pub max_output_tokens: u32,
    /// Local vector store path.
    pub knowledge_base_path: PathBuf,
    /// Prompt template override directory.
    pub prompt_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Creates a new builder for `AppConfig`.
    #[must_use]
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Resolves configuration from explicit overrides, the environment and
    /// a config file.
    ///
    /// When `path` is `None`, [`DEFAULT_CONFIG_FILE`] is read if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit file is missing, the file is
    /// malformed or has unknown keys, an environment variable does not
    /// parse, or a value is out of range.
    pub fn load(overrides: AppConfigBuilder, path: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = overrides.from_env()?;
        let builder = match path {
            Some(path) => builder.merge(AppConfigBuilder::from_file(path)?),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    builder.merge(AppConfigBuilder::from_file(default)?)
                } else {
                    builder
                }
            }
        };
        builder.build()
    }

    /// Provider settings for a new run.
    #[must_use]
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            kind: self.provider,
            model: self.model_name.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            base_url: self.base_url.clone(),
            compliance_model: self.compliance_model_name.clone(),
        }
    }

    /// Retrieval profile stamped on a new run.
    #[must_use]
    pub fn retrieval_profile(&self) -> RetrievalProfile {
        RetrievalProfile {
            top_k: self.top_k,
            max_context_tokens: self.max_context_tokens,
            compliance_top_k: self.compliance_top_k,
            compliance_max_context_tokens: self.compliance_max_context_tokens,
            doc_filter: None,
        }
    }

    /// Retry policy shared by retrieval and generation.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_base, self.backoff_max)
    }

    /// Renders the resolved configuration in config-file form (API key omitted).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let layer = AppConfigBuilder {
            provider: Some(self.provider.as_str().to_string()),
            model_name: Some(self.model_name.clone()),
            compliance_model_name: self.compliance_model_name.clone(),
            api_key: None,
            base_url: self.base_url.clone(),
            top_k: Some(self.top_k),
            max_context_tokens: Some(self.max_context_tokens),
            compliance_top_k: Some(self.compliance_top_k),
            compliance_max_context_tokens: Some(self.compliance_max_context_tokens),
            max_retries: Some(self.max_retries),
            checkpoint_path: Some(self.checkpoint_path.clone()),
            concurrency: Some(self.concurrency),
            max_attempts: Some(self.max_attempts),
            max_inflight_generations: Some(self.max_inflight_generations),
            min_similarity: Some(self.min_similarity),
            candidate_pool: Some(self.candidate_pool),
            tie_break: Some(self.tie_break.as_str().to_string()),
            request_timeout_secs: Some(self.request_timeout.as_secs()),
            retrieval_timeout_secs: Some(self.retrieval_timeout.as_secs()),
            backoff_base_ms: Some(duration_ms(self.backoff_base)),
            backoff_max_ms: Some(duration_ms(self.backoff_max)),
            temperature: Some(self.temperature),
            max_output_tokens: Some(self.max_output_tokens),
            knowledge_base_path: Some(self.knowledge_base_path.clone()),
            prompt_dir: self.prompt_dir.clone(),
        };
        toml::to_string(&layer).map_err(|e| ConfigError::Invalid {
            key: "config",
            message: e.to_string(),
        })
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Builder for [`AppConfig`].
///
/// Doubles as the config-file schema: each field is one recognized option.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfigBuilder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compliance_model_name: Option<String>,
    #[serde(skip)]
    api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_context_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compliance_top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compliance_max_context_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checkpoint_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_inflight_generations: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_similarity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate_pool: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tie_break: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retrieval_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff_base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff_max_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    knowledge_base_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt_dir: Option<PathBuf>,
}

macro_rules! fill {
    ($self:ident, $other:ident; $($field:ident),+ $(,)?) => {
        $( if $self.$field.is_none() { $self.$field = $other.$field; } )+
    };
}

impl AppConfigBuilder {
    /// Parses a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] (which names
    /// any unrecognized option).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Parses config-file text.
    ///
    /// # Errors
    ///
    /// Returns the parser message on malformed TOML or unknown keys.
    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Populates unset fields from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] naming the first variable that is set
    /// but does not parse.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.from_env_with(|key| std::env::var(key).ok())
    }

    /// Populates unset fields from `lookup`, keyed by environment variable name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] naming the first variable that is set
    /// but does not parse.
    pub fn from_env_with(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn number<T>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
        where
            T: std::str::FromStr,
            T::Err: std::fmt::Display,
        {
            value
                .map(|raw| {
                    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
                        var,
                        value: raw.clone(),
                        message: e.to_string(),
                    })
                })
                .transpose()
        }
        macro_rules! env_number {
            ($this:ident.$field:ident, $var:literal) => {
                if $this.$field.is_none() {
                    $this.$field = number($var, lookup($var))?;
                }
            };
        }

        if self.provider.is_none() {
            self.provider = lookup("RFP_PROVIDER");
        }
        if self.model_name.is_none() {
            self.model_name = lookup("RFP_MODEL");
        }
        if self.compliance_model_name.is_none() {
            self.compliance_model_name = lookup("RFP_COMPLIANCE_MODEL");
        }
        if self.api_key.is_none() {
            self.api_key = lookup("OPENAI_API_KEY").or_else(|| lookup("RFP_API_KEY"));
        }
        if self.base_url.is_none() {
            self.base_url = lookup("RFP_BASE_URL");
        }
        env_number!(self.top_k, "RFP_TOP_K");
        env_number!(self.max_context_tokens, "RFP_MAX_CONTEXT_TOKENS");
        env_number!(self.compliance_top_k, "RFP_COMPLIANCE_TOP_K");
        env_number!(self.compliance_max_context_tokens, "RFP_COMPLIANCE_MAX_CONTEXT_TOKENS");
        env_number!(self.max_retries, "RFP_MAX_RETRIES");
        if self.checkpoint_path.is_none() {
            self.checkpoint_path = lookup("RFP_CHECKPOINT_PATH").map(PathBuf::from);
        }
        env_number!(self.concurrency, "RFP_CONCURRENCY");
        env_number!(self.max_attempts, "RFP_MAX_ATTEMPTS");
        env_number!(self.max_inflight_generations, "RFP_MAX_INFLIGHT_GENERATIONS");
        env_number!(self.min_similarity, "RFP_MIN_SIMILARITY");
        env_number!(self.request_timeout_secs, "RFP_REQUEST_TIMEOUT_SECS");
        env_number!(self.temperature, "RFP_TEMPERATURE");
        if self.knowledge_base_path.is_none() {
            self.knowledge_base_path = lookup("RFP_KNOWLEDGE_BASE").map(PathBuf::from);
        }
        if self.prompt_dir.is_none() {
            self.prompt_dir = lookup("RFP_PROMPT_DIR").map(PathBuf::from);
        }
        Ok(self)
    }

    /// Fills fields still unset from a lower-precedence layer.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        fill!(self, other;
            provider, model_name, compliance_model_name, api_key, base_url, top_k,
            max_context_tokens, compliance_top_k, compliance_max_context_tokens,
            max_retries, checkpoint_path, concurrency, max_attempts,
            max_inflight_generations, min_similarity, candidate_pool, tie_break,
            request_timeout_secs, retrieval_timeout_secs, backoff_base_ms,
            backoff_max_ms, temperature, max_output_tokens, knowledge_base_path,
            prompt_dir,
        );
        self
    }

    /// Sets the provider name (`cloud` or `local`).
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn model_name(mut self, model: impl Into<String>) -> Self {
        self.model_name = Some(model.into());
        self
    }

    /// Sets the model used for compliance sections.
    #[must_use]
    pub fn compliance_model_name(mut self, model: impl Into<String>) -> Self {
        self.compliance_model_name = Some(model.into());
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL override.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the retrieval passage cap.
    #[must_use]
    pub const fn top_k(mut self, n: usize) -> Self {
        self.top_k = Some(n);
        self
    }

    /// Sets the retrieval token budget.
    #[must_use]
    pub const fn max_context_tokens(mut self, n: usize) -> Self {
        self.max_context_tokens = Some(n);
        self
    }

    /// Sets the compliance retrieval budget.
    #[must_use]
    pub const fn compliance_budget(mut self, top_k: usize, max_context_tokens: usize) -> Self {
        self.compliance_top_k = Some(top_k);
        self.compliance_max_context_tokens = Some(max_context_tokens);
        self
    }

    /// Sets the transient retry ceiling.
    #[must_use]
    pub const fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Sets the checkpoint database path.
    #[must_use]
    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub const fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = Some(n);
        self
    }

    /// Sets the per-section attempt ceiling.
    #[must_use]
    pub const fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// Sets the global generation ceiling.
    #[must_use]
    pub const fn max_inflight_generations(mut self, n: usize) -> Self {
        self.max_inflight_generations = Some(n);
        self
    }

    /// Sets the similarity threshold.
    #[must_use]
    pub const fn min_similarity(mut self, v: f32) -> Self {
        self.min_similarity = Some(v);
        self
    }

    /// Sets the tie-break rule (`chunk_id` or `store_order`).
    #[must_use]
    pub fn tie_break(mut self, rule: impl Into<String>) -> Self {
        self.tie_break = Some(rule.into());
        self
    }

    /// Sets the generation call timeout.
    #[must_use]
    pub const fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    /// Sets the backoff delays.
    #[must_use]
    pub const fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.backoff_base_ms = Some(base);
        self.backoff_max_ms = Some(max);
        self
    }

    /// Sets the knowledge-base path.
    #[must_use]
    pub fn knowledge_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.knowledge_base_path = Some(path.into());
        self
    }

    /// Sets the prompt template directory.
    #[must_use]
    pub fn prompt_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompt_dir = Some(dir.into());
        self
    }

    /// Builds and validates the [`AppConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first out-of-range option.
    pub fn build(self) -> Result<AppConfig, ConfigError> {
        let provider = match self.provider.as_deref() {
            None => ProviderKind::Local,
            Some(name) => ProviderKind::parse(name).ok_or_else(|| ConfigError::Invalid {
                key: "provider",
                message: format!("unknown provider '{name}' (expected 'cloud' or 'local')"),
            })?,
        };
        let tie_break = match self.tie_break.as_deref() {
            None => TieBreak::default(),
            Some(rule) => TieBreak::parse(rule).ok_or_else(|| ConfigError::Invalid {
                key: "tie_break",
                message: format!("unknown rule '{rule}' (expected 'chunk_id' or 'store_order')"),
            })?,
        };

        let config = AppConfig {
            provider,
            model_name: self
                .model_name
                .unwrap_or_else(|| provider.default_model().to_string()),
            compliance_model_name: self.compliance_model_name.filter(|m| !m.trim().is_empty()),
            api_key: self.api_key.filter(|k| !k.is_empty()),
            base_url: self.base_url.filter(|u| !u.is_empty()),
            top_k: self.top_k.unwrap_or(DEFAULT_TOP_K),
            max_context_tokens: self.max_context_tokens.unwrap_or(DEFAULT_MAX_CONTEXT_TOKENS),
            compliance_top_k: self.compliance_top_k.unwrap_or(DEFAULT_COMPLIANCE_TOP_K),
            compliance_max_context_tokens: self
                .compliance_max_context_tokens
                .unwrap_or(DEFAULT_COMPLIANCE_MAX_CONTEXT_TOKENS),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            checkpoint_path: self
                .checkpoint_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_PATH)),
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            max_inflight_generations: self
                .max_inflight_generations
                .unwrap_or(DEFAULT_MAX_INFLIGHT_GENERATIONS),
            min_similarity: self.min_similarity.unwrap_or(DEFAULT_MIN_SIMILARITY),
            candidate_pool: self.candidate_pool.unwrap_or(DEFAULT_CANDIDATE_POOL),
            tie_break,
            request_timeout: Duration::from_secs(
                self.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            retrieval_timeout: Duration::from_secs(
                self.retrieval_timeout_secs
                    .unwrap_or(DEFAULT_RETRIEVAL_TIMEOUT_SECS),
            ),
            backoff_base: Duration::from_millis(
                self.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
            ),
            backoff_max: Duration::from_millis(self.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS)),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_output_tokens: self.max_output_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
            knowledge_base_path: self
                .knowledge_base_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KNOWLEDGE_BASE_PATH)),
            prompt_dir: self.prompt_dir,
        };
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    let invalid = |key: &'static str, message: &str| {
        Err(ConfigError::Invalid {
            key,
            message: message.to_string(),
        })
    };

    if config.model_name.trim().is_empty() {
        return invalid("model_name", "must not be empty");
    }
    if config.top_k == 0 {
        return invalid("top_k", "must be at least 1");
    }
    if config.compliance_top_k == 0 {
        return invalid("compliance_top_k", "must be at least 1");
    }
    if config.concurrency == 0 {
        return invalid("concurrency", "must be at least 1");
    }
    if config.max_attempts == 0 {
        return invalid("max_attempts", "must be at least 1");
    }
    if config.max_inflight_generations == 0 {
        return invalid("max_inflight_generations", "must be at least 1");
    }
    if !(0.0..=1.0).contains(&config.min_similarity) {
        return invalid("min_similarity", "must be within [0, 1]");
    }
    if !(0.0..=2.0).contains(&config.temperature) {
        return invalid("temperature", "must be within [0, 2]");
    }
    if config.max_output_tokens == 0 {
        return invalid("max_output_tokens", "must be at least 1");
    }
    if config.request_timeout.is_zero() {
        return invalid("request_timeout_secs", "must be at least 1");
    }
    if config.retrieval_timeout.is_zero() {
        return invalid("retrieval_timeout_secs", "must be at least 1");
    }
    if config.backoff_base > config.backoff_max {
        return invalid("backoff_base_ms", "must not exceed backoff_max_ms");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_builder_defaults() {
        let config = AppConfig::builder().build().unwrap_or_else(|_| unreachable!());
        assert_eq!(config.provider, ProviderKind::Local);
        assert_eq!(config.model_name, "llama3:8b-instruct-q4_K_M");
        assert_eq!(config.top_k, 3);
        assert_eq!(config.max_context_tokens, 2000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.max_inflight_generations, 2);
        assert_eq!(config.tie_break, TieBreak::ChunkId);
        assert_eq!(config.checkpoint_path, PathBuf::from(".rfp/checkpoints.db"));
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert_eq!(config.compliance_top_k, 1);
        assert_eq!(config.compliance_max_context_tokens, 800);
        assert_eq!(config.compliance_model_name, None);
    }

    #[test]
    fn test_cloud_default_model() {
        let config = AppConfig::builder()
            .provider("cloud")
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.model_name, "gpt-4o-mini");
        assert_eq!(config.provider_config().kind, ProviderKind::Cloud);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let err = AppConfigBuilder::from_toml("top_k = 5\nmax_pasages = 3\n").err();
        assert!(err.is_some_and(|m| m.contains("max_pasages")));
    }

    #[test]
    fn test_api_key_not_accepted_from_file() {
        assert!(AppConfigBuilder::from_toml("api_key = \"sk-test\"\n").is_err());
    }

    #[test]
    fn test_precedence_cli_env_file_default() {
        let file = AppConfigBuilder::from_toml("top_k = 5\nconcurrency = 8\nmodel_name = \"file-model\"\n")
            .unwrap_or_else(|_| unreachable!());
        let config = AppConfig::builder()
            .top_k(7)
            .from_env_with(env(&[("RFP_TOP_K", "6"), ("RFP_CONCURRENCY", "2")]))
            .unwrap_or_else(|_| unreachable!())
            .merge(file)
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.top_k, 7);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.model_name, "file-model");
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_api_key_from_env() {
        let config = AppConfig::builder()
            .from_env_with(env(&[("RFP_API_KEY", "sk-abc")]))
            .unwrap_or_else(|_| unreachable!())
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.api_key.as_deref(), Some("sk-abc"));
    }

    #[test]
    fn test_malformed_env_value_is_an_error() {
        let err = AppConfig::builder()
            .from_env_with(env(&[("RFP_TOP_K", "abc")]))
            .err();
        assert!(matches!(err, Some(ConfigError::Env { var: "RFP_TOP_K", .. })));
        assert!(err.is_some_and(|e| e.to_string().contains("RFP_TOP_K=\"abc\"")));

        // An explicit override wins, so the bad variable is never read.
        let config = AppConfig::builder()
            .top_k(2)
            .from_env_with(env(&[("RFP_TOP_K", "abc")]))
            .unwrap_or_else(|_| unreachable!())
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(config.top_k, 2);

        assert!(
            AppConfig::builder()
                .from_env_with(env(&[("RFP_TEMPERATURE", "warm")]))
                .is_err()
        );
    }

    #[test]
    fn test_compliance_overrides() {
        let config = AppConfig::builder()
            .from_env_with(env(&[("RFP_COMPLIANCE_TOP_K", "2"), ("RFP_COMPLIANCE_MODEL", "phi3:mini")]))
            .unwrap_or_else(|_| unreachable!())
            .merge(
                AppConfigBuilder::from_toml("compliance_max_context_tokens = 600\n")
                    .unwrap_or_else(|_| unreachable!()),
            )
            .build()
            .unwrap_or_else(|_| unreachable!());
        let profile = config.retrieval_profile();
        assert_eq!(profile.compliance_top_k, 2);
        assert_eq!(profile.compliance_max_context_tokens, 600);
        assert_eq!(profile.top_k, 3);
        assert_eq!(config.provider_config().compliance_model.as_deref(), Some("phi3:mini"));
        assert!(AppConfig::builder().compliance_budget(0, 800).build().is_err());
    }

    #[test]
    fn test_validation_errors() {
        assert!(AppConfig::builder().top_k(0).build().is_err());
        assert!(AppConfig::builder().concurrency(0).build().is_err());
        assert!(AppConfig::builder().min_similarity(1.5).build().is_err());
        assert!(AppConfig::builder().provider("gemini").build().is_err());
        assert!(AppConfig::builder().tie_break("random").build().is_err());
        assert!(AppConfig::builder().backoff_ms(5000, 100).build().is_err());
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = AppConfig::builder()
            .provider("cloud")
            .top_k(4)
            .api_key("secret")
            .build()
            .unwrap_or_else(|_| unreachable!());
        let text = config.to_toml().unwrap_or_default();
        assert!(!text.contains("secret"));
        let reparsed = AppConfigBuilder::from_toml(&text)
            .unwrap_or_else(|_| unreachable!())
            .build()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(reparsed.top_k, 4);
        assert_eq!(reparsed.provider, ProviderKind::Cloud);
    }

    #[test]
    fn test_load_explicit_missing_file() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let missing = dir.path().join("absent.toml");
        let err = AppConfig::load(AppConfigBuilder::default(), Some(&missing)).err();
        assert!(matches!(err, Some(ConfigError::Read { .. })));
    }
}

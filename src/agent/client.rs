//! Backend registry and factory.
//!
//! Maps a [`ProviderConfig`] to a concrete [`CompletionBackend`]. Backends
//! are built lazily and cached per `(kind, base_url)`, so switching a run's
//! provider back and forth reuses clients.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::agent::provider::CompletionBackend;
use crate::agent::providers::{OllamaBackend, OpenAiBackend};
use crate::core::{ProviderConfig, ProviderKind};
use crate::error::ProviderError;

/// Creates the backend for `provider`.
///
/// # Supported Providers
///
/// - `cloud`: OpenAI-compatible APIs via `async-openai` (needs an API key)
/// - `local`: Ollama over HTTP
///
/// # Errors
///
/// Returns [`ProviderError::ApiKeyMissing`] for `cloud` without a key.
pub fn create_backend(
    provider: &ProviderConfig,
    api_key: Option<&str>,
) -> Result<Arc<dyn CompletionBackend>, ProviderError> {
    match provider.kind {
        ProviderKind::Cloud => {
            let key = api_key
                .filter(|k| !k.trim().is_empty())
                .ok_or(ProviderError::ApiKeyMissing)?;
            Ok(Arc::new(OpenAiBackend::new(key, provider.base_url.as_deref())))
        }
        ProviderKind::Local => Ok(Arc::new(OllamaBackend::new(provider.base_url.as_deref())?)),
    }
}

type CacheKey = (ProviderKind, Option<String>);

/// Resolves provider configurations to backends.
#[derive(Default)]
pub struct BackendRegistry {
    api_key: Option<String>,
    fixed: HashMap<ProviderKind, Arc<dyn CompletionBackend>>,
    cache: Mutex<HashMap<CacheKey, Arc<dyn CompletionBackend>>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("fixed", &self.fixed.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl BackendRegistry {
    /// Creates a registry that builds real backends on demand.
    #[must_use]
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            ..Self::default()
        }
    }

    /// Serves `kind` from `backend` regardless of model or base URL.
    #[must_use]
    pub fn with_backend(mut self, kind: ProviderKind, backend: Arc<dyn CompletionBackend>) -> Self {
        self.fixed.insert(kind, backend);
        self
    }

    /// Returns the backend for `provider`.
    ///
    /// # Errors
    ///
    /// Propagates [`create_backend`] failures.
    pub fn resolve(&self, provider: &ProviderConfig) -> Result<Arc<dyn CompletionBackend>, ProviderError> {
        if let Some(backend) = self.fixed.get(&provider.kind) {
            return Ok(Arc::clone(backend));
        }

        let key = (provider.kind, provider.base_url.clone());
        if let Ok(cache) = self.cache.lock()
            && let Some(backend) = cache.get(&key)
        {
            return Ok(Arc::clone(backend));
        }

        let backend = create_backend(provider, self.api_key.as_deref())?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.entry(key).or_insert_with(|| Arc::clone(&backend));
        }
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_local_backend() {
        let backend = create_backend(&ProviderConfig::new(ProviderKind::Local), None);
        assert_eq!(backend.map(|b| b.name()).ok(), Some("ollama"));
    }

    #[test]
    fn test_cloud_requires_key() {
        let cloud = ProviderConfig::new(ProviderKind::Cloud);
        assert!(matches!(create_backend(&cloud, None), Err(ProviderError::ApiKeyMissing)));
        assert!(matches!(create_backend(&cloud, Some("  ")), Err(ProviderError::ApiKeyMissing)));
        assert_eq!(create_backend(&cloud, Some("sk-test")).map(|b| b.name()).ok(), Some("openai"));
    }

    #[test]
    fn test_registry_caches_by_kind_and_url() {
        let registry = BackendRegistry::new(Some("sk-test".to_string()));
        let local = ProviderConfig::new(ProviderKind::Local);
        let a = registry.resolve(&local).unwrap_or_else(|_| unreachable!());
        let b = registry
            .resolve(&local.clone().with_model("mistral"))
            .unwrap_or_else(|_| unreachable!());
        assert!(Arc::ptr_eq(&a, &b));

        let mut remote = local;
        remote.base_url = Some("http://gpu-box:11434".to_string());
        let c = registry.resolve(&remote).unwrap_or_else(|_| unreachable!());
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
